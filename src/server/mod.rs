use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::config;
use crate::queue::LivenessProbe;
use crate::session::{ConnectionHandler, SessionContext};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9918;
pub const DEFAULT_ACCEPT_POLL_INTERVAL_MS: u64 = 50;

const LOG_CONTEXT: &str = "server";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub accept_poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            accept_poll_interval: Duration::from_millis(DEFAULT_ACCEPT_POLL_INTERVAL_MS),
        }
    }
}

impl From<&config::ServerConfig> for ServerConfig {
    fn from(value: &config::ServerConfig) -> Self {
        Self {
            host: value.host.clone(),
            port: value.port,
            accept_poll_interval: Duration::from_millis(value.accept_poll_interval_ms.max(1)),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    SpawnHandler {
        connection_id: u64,
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP listener to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone TCP stream for full duplex IO: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::SpawnHandler {
                connection_id,
                source,
            } => write!(
                f,
                "failed to spawn handler thread for connection {connection_id}: {source}"
            ),
        }
    }
}

impl std::error::Error for ServerError {}

/// An accepted client socket in blocking mode. The handler thread reads and
/// writes through clones obtained from `split`; the registry keeps this
/// handle to shut the socket down from outside.
#[derive(Debug)]
pub struct PersistentConnection {
    peer_addr: SocketAddr,
    stream: TcpStream,
}

impl PersistentConnection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        // Some platforms hand out accepted sockets inheriting the listener's mode.
        stream
            .set_nonblocking(false)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        Ok(Self { peer_addr, stream })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn split(&self) -> Result<(TcpStream, TcpStream), ServerError> {
        let reader = self
            .stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;
        let writer = self
            .stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;
        Ok((reader, writer))
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl LivenessProbe for PersistentConnection {
    /// Peeks one byte without blocking. EOF or a hard socket error means the
    /// peer has left; pending bytes or nothing to read mean it is still there.
    /// Only the owning handler thread calls this, while it is not reading.
    fn is_peer_gone(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }

        let mut probe = [0_u8; 1];
        let gone = match self.stream.peek(&mut probe) {
            Ok(0) => true,
            Ok(_) => false,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                false
            }
            Err(_) => true,
        };

        self.stream.set_nonblocking(false).is_err() || gone
    }
}

/// Where the accept loop takes new sockets from.
trait ConnectionSource {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl ConnectionSource for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }
}

/// Only a listener that can no longer accept at all ends the loop; running
/// out of descriptors or kernel buffers is waited out.
fn accept_failure_is_fatal(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::InvalidInput)
}

pub struct TcpServer {
    listener: TcpListener,
    accept_poll_interval: Duration,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            accept_poll_interval: config.accept_poll_interval,
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        Self::bind(&ServerConfig::from(&app_config.server))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `stop` is set, one handler thread per connection.
    /// On the way out every registered socket is shut down and every handler
    /// joined, so no thread outlives the call.
    pub fn serve(&self, context: &SessionContext, stop: &AtomicBool) -> Result<(), ServerError> {
        self.serve_from(&self.listener, context, stop)
    }

    fn serve_from<S: ConnectionSource>(
        &self,
        incoming: &S,
        context: &SessionContext,
        stop: &AtomicBool,
    ) -> Result<(), ServerError> {
        let mut handlers: Vec<JoinHandle<()>> = Vec::new();
        let mut failed_accepts: u64 = 0;

        let outcome = loop {
            if stop.load(Ordering::SeqCst) {
                break Ok(());
            }

            match incoming.accept() {
                Ok((stream, peer_addr)) => {
                    if failed_accepts > 0 {
                        context.logger.info(
                            Some(LOG_CONTEXT),
                            &format!("accepting again after {failed_accepts} failed attempt(s)"),
                        );
                        failed_accepts = 0;
                    }
                    if let Some(handle) = self.spawn_handler(context, stream, peer_addr) {
                        handlers.push(handle);
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.accept_poll_interval);
                }
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    context.logger.debug(
                        Some(LOG_CONTEXT),
                        &format!("transient accept failure: {error}"),
                    );
                }
                Err(source) if accept_failure_is_fatal(&source) => {
                    break Err(ServerError::Accept { source });
                }
                Err(error) => {
                    // Descriptor or buffer exhaustion clears once handlers exit.
                    failed_accepts += 1;
                    let message = format!("accept failed, backing off: {error}");
                    if failed_accepts == 1 {
                        context.logger.warn(Some(LOG_CONTEXT), &message);
                    } else {
                        context.logger.debug(Some(LOG_CONTEXT), &message);
                    }
                    thread::sleep(self.accept_poll_interval);
                }
            }

            handlers.retain(|handle| !handle.is_finished());
        };

        let closed = context.registry.shutdown_all();
        context.logger.info(
            Some(LOG_CONTEXT),
            &format!("closing {closed} open connection(s)"),
        );
        for handle in handlers {
            if handle.join().is_err() {
                context
                    .logger
                    .error(Some(LOG_CONTEXT), "connection handler thread panicked");
            }
        }

        outcome
    }

    fn spawn_handler(
        &self,
        context: &SessionContext,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Option<JoinHandle<()>> {
        let connection = match PersistentConnection::new(stream, peer_addr) {
            Ok(connection) => Arc::new(connection),
            Err(error) => {
                context.logger.warn(Some(LOG_CONTEXT), &error.to_string());
                return None;
            }
        };

        let id = context.registry.register(peer_addr, Arc::clone(&connection));
        context.logger.log(
            crate::logging::LogLevel::Info,
            Some(LOG_CONTEXT),
            "client connected",
            Some(json!({
                "connection_id": id,
                "peer": peer_addr.to_string(),
                "clients": context.registry.count(),
            })),
        );

        let handler = ConnectionHandler::new(id, Arc::clone(&connection), context.clone());
        match thread::Builder::new()
            .name(format!("wukong-conn-{id}"))
            .spawn(move || {
                handler.run();
            }) {
            Ok(handle) => Some(handle),
            Err(source) => {
                let _ = context.registry.unregister(id);
                let _ = connection.shutdown();
                let error = ServerError::SpawnHandler {
                    connection_id: id,
                    source,
                };
                context.logger.error(Some(LOG_CONTEXT), &error.to_string());
                None
            }
        }
    }
}
