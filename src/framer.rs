//! CRLF line framing over a transport that can be upgraded to TLS
//! mid-session.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Writes are flushed per line, so a short fixed deadline is enough.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum FramerError {
    /// The read deadline elapsed with no data.
    #[error("read timed out")]
    Timeout,

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// STARTTLS was attempted on a transport that is already encrypted.
    #[error("transport is already encrypted")]
    AlreadyEncrypted,

    /// The TLS handshake failed; the transport is unusable afterwards.
    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Replays bytes that were buffered ahead of a line boundary before
/// reading from the underlying socket again.
///
/// The STARTTLS handshake bytes may already sit in the framer's buffer
/// when the upgrade starts; wrapping the socket in `Rewind` hands them to
/// the handshake instead of discarding them.
pub struct Rewind {
    head: Vec<u8>,
    consumed: usize,
    inner: TcpStream,
}

impl Rewind {
    pub fn new(head: Vec<u8>, inner: TcpStream) -> Self {
        Self {
            head,
            consumed: 0,
            inner,
        }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.consumed < this.head.len() {
            let remaining = &this.head[this.consumed..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.consumed += take;
            if this.consumed == this.head.len() {
                this.head.clear();
                this.consumed = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// The one owned duplex stream behind a connection, plain or encrypted.
///
/// `Unusable` is the state after a failed upgrade: the handshake consumed
/// the socket, so any further I/O reports the stream as gone.
pub enum Transport {
    Plain(Rewind),
    Tls(Box<TlsStream<Rewind>>),
    Unusable,
}

impl Transport {
    fn gone() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "transport is gone")
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Unusable => Poll::Ready(Err(Transport::gone())),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Unusable => Poll::Ready(Err(Transport::gone())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Unusable => Poll::Ready(Err(Transport::gone())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Unusable => Poll::Ready(Err(Transport::gone())),
        }
    }
}

/// Turns the raw byte stream into CRLF-terminated text lines and back.
///
/// Every read is bounded by the configured read deadline and every write
/// by a short fixed one, so a single blocked call cannot stall the
/// connection's cancellation checks.
pub struct LineFramer {
    transport: Transport,
    buffer: Vec<u8>,
    read_timeout: Duration,
}

impl LineFramer {
    pub fn plain(stream: TcpStream, read_timeout: Duration) -> Self {
        Self {
            transport: Transport::Plain(Rewind::new(Vec::new(), stream)),
            buffer: Vec::new(),
            read_timeout,
        }
    }

    pub fn tls(stream: TlsStream<Rewind>, read_timeout: Duration) -> Self {
        Self {
            transport: Transport::Tls(Box::new(stream)),
            buffer: Vec::new(),
            read_timeout,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Reads one line, stripping the CR/LF terminator.
    pub async fn read_line(&mut self) -> Result<String, FramerError> {
        loop {
            if let Some(position) = self.buffer.iter().position(|&byte| byte == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = time::timeout(self.read_timeout, self.transport.read(&mut chunk))
                .await
                .map_err(|_| FramerError::Timeout)??;

            if read == 0 {
                return Err(FramerError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Writes one line followed by CRLF and flushes it to the wire.
    pub async fn write_line(&mut self, line: &str) -> Result<(), FramerError> {
        time::timeout(WRITE_TIMEOUT, async {
            self.transport.write_all(line.as_bytes()).await?;
            self.transport.write_all(b"\r\n").await?;
            self.transport.flush().await
        })
        .await
        .map_err(|_| FramerError::Timeout)??;

        Ok(())
    }

    /// Swaps the plaintext transport for an encrypted one.
    ///
    /// Outbound lines are flushed as they are written, so only the read
    /// side can hold state: bytes buffered past the last line boundary are
    /// replayed into the handshake. The handshake is bounded by the read
    /// deadline; on failure or expiry the transport is left unusable and
    /// the connection must close.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> Result<(), FramerError> {
        let stream = match std::mem::replace(&mut self.transport, Transport::Unusable) {
            Transport::Plain(stream) => stream,
            transport @ Transport::Tls(_) => {
                self.transport = transport;
                return Err(FramerError::AlreadyEncrypted);
            }
            Transport::Unusable => return Err(FramerError::Io(Transport::gone())),
        };

        let Rewind { mut head, consumed, inner } = stream;
        head.drain(..consumed);
        let mut lookahead = std::mem::take(&mut self.buffer);
        lookahead.extend_from_slice(&head);

        let handshake = acceptor.accept(Rewind::new(lookahead, inner));
        match time::timeout(self.read_timeout, handshake).await {
            Ok(Ok(tls_stream)) => {
                self.transport = Transport::Tls(Box::new(tls_stream));
                Ok(())
            }
            Ok(Err(error)) => Err(FramerError::Handshake(error)),
            Err(_) => Err(FramerError::Handshake(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake timed out",
            ))),
        }
    }
}
