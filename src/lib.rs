//! mailsink, a minimal SMTP receiver.
//!
//! Accepts inbound connections, speaks the SMTP command protocol with
//! optional STARTTLS, and records envelopes and message bodies to disk.
//! It is not a mail-transfer agent: nothing is delivered onward.

pub mod commands;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod framer;
pub mod logger;
pub mod response;
pub mod retry;
pub mod server;
pub mod store;

pub use config::Config;
pub use envelope::Envelope;
pub use server::SmtpServer;
