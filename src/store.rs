//! File-backed persistence for connections, wire traffic, and finished
//! messages.
//!
//! Store failures never fail the protocol exchange; callers log them and
//! carry on. With no data directory configured the store only hands out
//! connection ids.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::io::AsyncWriteExt;

use crate::envelope::Envelope;

/// Which way a recorded wire line travelled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn marker(self) -> char {
        match self {
            Direction::In => '<',
            Direction::Out => '>',
        }
    }
}

pub struct MessageStore {
    root: Option<PathBuf>,
    next_connection_id: AtomicU64,
    next_mail_id: AtomicU64,
}

impl MessageStore {
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = &root {
            if !root.exists() {
                std::fs::create_dir_all(root)
                    .with_context(|| format!("failed to create data directory {:?}", root))?;
            }
        }

        Ok(Self {
            root,
            next_connection_id: AtomicU64::new(1),
            next_mail_id: AtomicU64::new(1),
        })
    }

    /// Assigns the connection id used for log and transcript correlation.
    pub fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends the accept record for a newly allocated connection id.
    pub async fn record_connection(&self, connection_id: u64, remote: SocketAddr) -> Result<()> {
        if let Some(root) = &self.root {
            let record = format!(
                "{} connection {} from {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                connection_id,
                remote,
            );
            append(&root.join("connections.log"), record.as_bytes()).await?;
        }

        Ok(())
    }

    /// Appends one wire line to the per-connection transcript.
    pub async fn record_message(
        &self,
        connection_id: u64,
        direction: Direction,
        data: &str,
    ) -> Result<()> {
        if let Some(root) = &self.root {
            let record = format!("{} {}\n", direction.marker(), data);
            let path = root.join(format!("conn_{:06}.log", connection_id));
            append(&path, record.as_bytes()).await?;
        }
        Ok(())
    }

    /// Writes the finished message with its envelope metadata and returns
    /// the mail id.
    pub async fn record_mail(&self, connection_id: u64, envelope: &Envelope) -> Result<u64> {
        let mail_id = self.next_mail_id.fetch_add(1, Ordering::Relaxed);

        if let Some(root) = &self.root {
            let mut content = String::new();
            if let Some(from) = &envelope.from {
                content.push_str(&format!("X-Mailsink-From: {}\r\n", from));
            }
            for to in &envelope.to {
                content.push_str(&format!("X-Mailsink-To: {}\r\n", to));
            }
            content.push_str(&format!("X-Mailsink-Connection: {}\r\n", connection_id));
            content.push_str(&format!(
                "X-Mailsink-Date: {}\r\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
            ));
            content.push_str("\r\n");
            content.push_str(&envelope.data);

            let filename = format!(
                "{}_{:06}_{:06}.eml",
                Local::now().format("%Y%m%d_%H%M%S"),
                connection_id,
                mail_id,
            );
            tokio::fs::write(root.join(filename), content)
                .await
                .context("failed to write mail file")?;
        }

        Ok(mail_id)
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }
}

async fn append(path: &std::path::Path, record: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {:?}", path))?;
    file.write_all(record).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_addr() -> SocketAddr {
        "127.0.0.1:2525".parse().unwrap()
    }

    #[tokio::test]
    async fn disabled_store_still_assigns_ids() {
        let store = MessageStore::new(None).unwrap();
        assert!(!store.is_enabled());

        let first = store.allocate_connection_id();
        let second = store.allocate_connection_id();
        assert_ne!(first, second);

        store.record_connection(first, local_addr()).await.unwrap();
        store
            .record_message(first, Direction::In, "NOOP")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mail_file_holds_envelope_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(Some(dir.path().to_path_buf())).unwrap();

        let connection_id = store.allocate_connection_id();
        store
            .record_connection(connection_id, local_addr())
            .await
            .unwrap();

        let mut envelope = Envelope::new();
        envelope.set_sender("a@example.com".to_string());
        envelope.add_recipient("b@example.com".to_string());
        envelope.append_line("Hello");
        envelope.append_line("..stuffed");

        store.record_mail(connection_id, &envelope).await.unwrap();

        let mail_file = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.path().extension().is_some_and(|ext| ext == "eml"))
            .expect("mail file written");

        let content = std::fs::read_to_string(mail_file.path()).unwrap();
        assert!(content.contains("X-Mailsink-From: a@example.com"));
        assert!(content.contains("X-Mailsink-To: b@example.com"));
        assert!(content.contains("Hello\n.stuffed\n"));
    }

    #[tokio::test]
    async fn transcript_collects_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(Some(dir.path().to_path_buf())).unwrap();

        let connection_id = store.allocate_connection_id();
        store
            .record_message(connection_id, Direction::In, "NOOP")
            .await
            .unwrap();
        store
            .record_message(connection_id, Direction::Out, "250 OK")
            .await
            .unwrap();

        let transcript = std::fs::read_to_string(
            dir.path().join(format!("conn_{:06}.log", connection_id)),
        )
        .unwrap();
        assert_eq!(transcript, "< NOOP\n> 250 OK\n");
    }
}
