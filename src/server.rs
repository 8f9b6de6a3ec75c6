//! Connection lifecycle: accepting streams, one task per connection, the
//! shared registry of live connections, and graceful versus forced
//! shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time::{self, Instant};

use crate::config::Config;
use crate::connection::Connection;
use crate::framer::{LineFramer, Rewind};
use crate::logger::Logger;
use crate::store::MessageStore;

/// How often `drain` rechecks the registry while waiting it out.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Immutable collaborators shared by every connection task.
pub struct ServerContext {
    pub config: Config,
    pub logger: Logger,
    pub store: MessageStore,
}

/// The manager's view of one live connection.
///
/// The connection task owns its stream; the manager only flips this flag,
/// which the task rechecks at every read checkpoint.
pub struct ConnHandle {
    pub id: u64,
    disconnecting: AtomicBool,
}

impl ConnHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            disconnecting: AtomicBool::new(false),
        }
    }

    pub fn mark_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::Relaxed);
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Relaxed)
    }
}

struct Registered {
    handle: Arc<ConnHandle>,
    abort: AbortHandle,
}

pub struct SmtpServer {
    context: Arc<ServerContext>,
    listener: TcpListener,
    registry: Arc<Mutex<HashMap<u64, Registered>>>,
    shutdown: Notify,
    shutting_down: AtomicBool,
}

impl SmtpServer {
    pub async fn bind(config: Config) -> Result<Self> {
        let logger = Logger::new(config.log_file.clone())?;
        let store = MessageStore::new(config.data_dir.clone())?;

        let listen_address = config.listen_address();
        let listener = TcpListener::bind(&listen_address)
            .await
            .with_context(|| format!("failed to bind to {}", listen_address))?;

        logger
            .log(&format!("Started listening on {}", listener.local_addr()?))
            .await;

        Ok(Self {
            context: Arc::new(ServerContext {
                config,
                logger,
                store,
            }),
            listener,
            registry: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Accept loop. Returns once `stop` has been called.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.accept_connection(stream, remote).await,
                    Err(error) => {
                        if self.shutting_down.load(Ordering::Relaxed) {
                            return;
                        }
                        self.context
                            .logger
                            .log(&format!("Failed to accept connection: {}", error))
                            .await;
                    }
                },
            }
        }
    }

    async fn accept_connection(&self, stream: TcpStream, remote: SocketAddr) {
        let context = self.context.clone();
        context
            .logger
            .log_client(&remote, "accepted connection")
            .await;

        let id = context.store.allocate_connection_id();
        let handle = Arc::new(ConnHandle::new(id));

        // Setup runs on the connection's own task: the accept record is a
        // disk write and the implicit-TLS handshake waits on the client,
        // and neither may stall the accept loop. The task starts only
        // after its registry entry exists, so a short-lived connection
        // cannot race its own removal.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let registry = self.registry.clone();
        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;

            if let Err(error) = context.store.record_connection(id, remote).await {
                context
                    .logger
                    .log_client(&remote, &format!("failed to record connection: {}", error))
                    .await;
            }

            match initial_framer(&context, stream).await {
                Ok(framer) => {
                    let mut connection =
                        Connection::new(id, remote, framer, task_handle, context.clone());
                    connection.send_banner().await;
                    connection.wait_for_commands().await;
                }
                Err(error) => {
                    context
                        .logger
                        .log_client(&remote, &format!("TLS handshake failed: {}", error))
                        .await;
                }
            }

            context
                .logger
                .log_client(&remote, "connection closed")
                .await;
            registry.lock().await.remove(&id);
        });

        self.registry.lock().await.insert(
            id,
            Registered {
                handle,
                abort: task.abort_handle(),
            },
        );
        let _ = registered_tx.send(());
    }

    /// Signals the accept loop to exit and marks every live connection
    /// Disconnecting, so each answers its next exchange with 421 and
    /// closes.
    pub async fn stop(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.shutdown.notify_one();

        let registry = self.registry.lock().await;
        for registered in registry.values() {
            registered.handle.mark_disconnecting();
        }
        self.context
            .logger
            .log(&format!(
                "Stopping, {} connection(s) marked disconnecting",
                registry.len(),
            ))
            .await;
    }

    /// Waits for every connection task to exit, up to the grace deadline.
    /// Returns false if connections remain; the caller should then use
    /// `force_close_all`.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.registry.lock().await.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Unconditionally tears down every remaining connection by aborting
    /// its task, which drops and closes its stream.
    pub async fn force_close_all(&self) {
        let mut registry = self.registry.lock().await;
        for (_, registered) in registry.drain() {
            registered.abort.abort();
        }
    }
}

/// Builds the connection's framer; in implicit-TLS mode this performs the
/// handshake, bounded by the read deadline.
async fn initial_framer(context: &ServerContext, stream: TcpStream) -> Result<LineFramer> {
    let read_timeout = context.config.read_timeout;

    if context.config.implicit_tls {
        let acceptor = context
            .config
            .tls
            .as_ref()
            .context("implicit TLS requires TLS material")?;
        let tls_stream = time::timeout(
            read_timeout,
            acceptor.accept(Rewind::new(Vec::new(), stream)),
        )
        .await
        .context("TLS handshake timed out")??;
        return Ok(LineFramer::tls(tls_stream, read_timeout));
    }

    Ok(LineFramer::plain(stream, read_timeout))
}
