//! Runtime configuration, read once at startup and immutable afterwards.

use std::io::BufReader as StdBufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio_rustls::TlsAcceptor;

pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    /// Hostname announced in the greeting and EHLO reply.
    pub banner_host: String,
    /// Server software name announced in the greeting.
    pub banner_name: String,
    /// Maximum lifetime of one connection.
    pub connection_time_limit: Duration,
    /// Deadline applied to each read; also the cadence at which an idle
    /// connection rechecks its disconnect flag.
    pub read_timeout: Duration,
    /// Handshake immediately after accept instead of offering STARTTLS.
    pub implicit_tls: bool,
    pub tls: Option<TlsAcceptor>,
    pub data_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

/// Builds a TLS acceptor from PEM certificate and PKCS#8 key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("failed to open certificate {:?}", cert_path))?;
    let mut cert_reader = StdBufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|_| anyhow::anyhow!("failed to parse certificate {:?}", cert_path))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        anyhow::bail!("no certificate found in {:?}", cert_path);
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("failed to open private key {:?}", key_path))?;
    let mut key_reader = StdBufReader::new(key_file);
    let mut keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|_| anyhow::anyhow!("failed to parse private key {:?}", key_path))?;
    if keys.is_empty() {
        anyhow::bail!("no private key found in {:?}", key_path);
    }
    let private_key = PrivateKey(keys.remove(0));

    let tls_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|error| anyhow::anyhow!("failed to build TLS config: {}", error))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_acceptor_from_generated_material() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let mut cert_file = std::fs::File::create(&cert_path).unwrap();
        cert_file
            .write_all(cert.serialize_pem().unwrap().as_bytes())
            .unwrap();
        let mut key_file = std::fs::File::create(&key_path).unwrap();
        key_file
            .write_all(cert.serialize_private_key_pem().as_bytes())
            .unwrap();

        assert!(load_tls_acceptor(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn missing_material_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pem");
        assert!(load_tls_acceptor(&missing, &missing).is_err());
    }
}
