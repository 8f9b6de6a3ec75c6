use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use structopt::StructOpt;

use mailsink::config::{load_tls_acceptor, Config};
use mailsink::server::SmtpServer;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "mailsink",
    about = "A minimal SMTP receiver that records inbound mail without delivering it"
)]
pub struct Opt {
    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "2525")]
    pub port: u16,

    /// Hostname announced in the greeting and EHLO reply
    #[structopt(long = "banner-host", default_value = "mail.local")]
    pub banner_host: String,

    /// Server name announced in the greeting
    #[structopt(long = "banner-name", default_value = "mailsink")]
    pub banner_name: String,

    /// Maximum connection lifetime in seconds
    #[structopt(long = "connection-time-limit", default_value = "300")]
    pub connection_time_limit: u64,

    /// Per-read timeout in seconds
    #[structopt(long = "read-timeout", default_value = "30")]
    pub read_timeout: u64,

    /// TLS certificate file (PEM); enables STARTTLS
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PKCS#8 PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Handshake immediately after accept instead of offering STARTTLS
    #[structopt(long = "implicit-tls")]
    pub implicit_tls: bool,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Directory for connection transcripts and received mail
    #[structopt(long = "data", parse(from_os_str))]
    pub data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    let tls = match (&opt.tls_cert, &opt.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(load_tls_acceptor(cert_path, key_path)?),
        (None, None) => None,
        _ => anyhow::bail!("--tls-cert and --tls-key must be provided together"),
    };
    if opt.implicit_tls && tls.is_none() {
        anyhow::bail!("--implicit-tls requires --tls-cert and --tls-key");
    }

    let config = Config {
        listen_host: opt.address,
        listen_port: opt.port,
        banner_host: opt.banner_host,
        banner_name: opt.banner_name,
        connection_time_limit: Duration::from_secs(opt.connection_time_limit),
        read_timeout: Duration::from_secs(opt.read_timeout),
        implicit_tls: opt.implicit_tls,
        tls,
        data_dir: opt.data_dir,
        log_file: opt.log_file,
    };

    let grace = config.connection_time_limit + Duration::from_secs(1);
    let server = Arc::new(SmtpServer::bind(config).await?);

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.stop().await;
        }
    });

    server.run().await;

    if !server.drain(grace).await {
        eprintln!("[WARN] Graceful shutdown timed out, forcing connections closed");
        server.force_close_all().await;
    }

    Ok(())
}
