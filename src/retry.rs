//! Decides whether a failed read is worth retrying.

use std::io;
use std::time::Duration;

use crate::framer::FramerError;

/// Pause before retrying a recoverable read failure, so a stream that
/// keeps failing does not spin the loop hot.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Classification of a read failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorClass {
    /// The read deadline elapsed with no data. A no-op: the loop continues
    /// so the disconnect flag and lifetime deadline get rechecked.
    TransientTimeout,
    /// A recoverable condition. Log it and back off briefly before the
    /// next read, unless the connection is already disconnecting.
    TransientOther,
    /// The stream is unusable; terminate the read loop.
    Fatal,
}

pub fn classify(error: &FramerError) -> ErrorClass {
    match error {
        FramerError::Timeout => ErrorClass::TransientTimeout,
        FramerError::Io(error) => match error.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => ErrorClass::TransientOther,
            _ => ErrorClass::Fatal,
        },
        _ => ErrorClass::Fatal,
    }
}
