//! Timestamped console logging with an optional log file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::Local;
use tokio::sync::Mutex;

/// Converts control characters in untrusted client input to escape
/// sequences before they reach a terminal or log file.
pub fn sanitize(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for character in input.chars() {
        match character {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", character as u32));
            }
            _ if character.is_ascii_graphic() || character == ' ' => {
                result.push(character);
            }
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", character as u32));
            }
        }
    }
    result
}

pub struct Logger {
    writer: Option<Mutex<BufWriter<File>>>,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(Mutex::new(BufWriter::new(file)))
        } else {
            None
        };

        Ok(Self { writer })
    }

    pub async fn log(&self, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("{} {}\n", timestamp, sanitize(message));

        print!("{}", line);

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }

    pub async fn log_client(&self, remote: &SocketAddr, message: &str) {
        self.log(&format!("{} {}", remote, message)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_escapes_control_characters() {
        assert_eq!(sanitize("MAIL FROM:<a@x>"), "MAIL FROM:<a@x>");
        assert_eq!(sanitize("bad\x07bell"), "bad\\x07bell");
        assert_eq!(sanitize("nul\0byte"), "nul\\0byte");
        assert_eq!(sanitize("caf\u{e9}"), "caf\\u{e9}");
    }
}
