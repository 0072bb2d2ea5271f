pub mod dispatch;

use std::fmt;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::queue::BlockingQueue;
use crate::registry::ConnectionRegistry;
use crate::server::PersistentConnection;
use crate::wire::codec::{FrameRead, WireCodec};
use crate::wire::message::Request;

pub use dispatch::{dispatch, Dispatch};

const LOG_CONTEXT: &str = "session";

/// Everything a connection handler shares with the rest of the server.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub queue: Arc<BlockingQueue>,
    pub registry: Arc<ConnectionRegistry>,
    pub codec: WireCodec,
    pub logger: Arc<Logger>,
}

impl SessionContext {
    pub fn new(
        queue: Arc<BlockingQueue>,
        registry: Arc<ConnectionRegistry>,
        codec: WireCodec,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            queue,
            registry,
            codec,
            logger,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    InvalidFrame,
    ReadFailed,
    WriteFailed,
    InvalidMessage,
    PeerGoneWhileBlocked,
    SplitFailed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::InvalidFrame => "invalid_frame",
            Self::ReadFailed => "read_failed",
            Self::WriteFailed => "write_failed",
            Self::InvalidMessage => "invalid_message",
            Self::PeerGoneWhileBlocked => "peer_gone_while_blocked",
            Self::SplitFailed => "split_failed",
        }
    }

    fn is_protocol_error(self) -> bool {
        matches!(self, Self::InvalidFrame | Self::InvalidMessage)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Unregisters and closes the socket on every way out of `run`.
struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: u64,
    connection: Arc<PersistentConnection>,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let _ = self.registry.unregister(self.connection_id);
        let _ = self.connection.shutdown();
    }
}

/// Serves one client: read a frame, run it, write the reply, repeat. A
/// request is answered in full before the next frame is read.
pub struct ConnectionHandler {
    connection_id: u64,
    connection: Arc<PersistentConnection>,
    context: SessionContext,
}

impl ConnectionHandler {
    pub fn new(
        connection_id: u64,
        connection: Arc<PersistentConnection>,
        context: SessionContext,
    ) -> Self {
        Self {
            connection_id,
            connection,
            context,
        }
    }

    pub fn run(self) -> CloseReason {
        let guard = RegistrationGuard {
            registry: Arc::clone(&self.context.registry),
            connection_id: self.connection_id,
            connection: Arc::clone(&self.connection),
        };

        let reason = self.serve();
        drop(guard);

        let level = if reason.is_protocol_error() {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.context.logger.log(
            level,
            Some(LOG_CONTEXT),
            "client disconnected",
            Some(json!({
                "connection_id": self.connection_id,
                "peer": self.connection.peer_addr().to_string(),
                "reason": reason.as_str(),
                "clients": self.context.registry.count(),
            })),
        );
        reason
    }

    fn serve(&self) -> CloseReason {
        let logger = &self.context.logger;
        let (reader, writer) = match self.connection.split() {
            Ok(halves) => halves,
            Err(error) => {
                logger.error(Some(LOG_CONTEXT), &error.to_string());
                return CloseReason::SplitFailed;
            }
        };
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        let codec = self.context.codec;

        loop {
            let raw = match codec.read_frame(&mut reader) {
                Ok(FrameRead::Frame(raw)) => raw,
                Ok(FrameRead::Closed) => return CloseReason::PeerClosed,
                Err(error) if error.is_transport() => {
                    logger.debug(Some(LOG_CONTEXT), &format!("read failed: {error}"));
                    return CloseReason::ReadFailed;
                }
                Err(error) => {
                    logger.warn(Some(LOG_CONTEXT), &format!("bad frame: {error}"));
                    return CloseReason::InvalidFrame;
                }
            };
            let _ = self.context.registry.touch(self.connection_id);

            let request = match Request::from_raw(&raw) {
                Ok(request) => request,
                Err(error) => {
                    logger.warn(Some(LOG_CONTEXT), &format!("bad request: {error}"));
                    return CloseReason::InvalidMessage;
                }
            };
            let command = request.command;

            let reply = match dispatch(
                request,
                &self.context.queue,
                &self.context.registry,
                self.connection.as_ref(),
            ) {
                Dispatch::Reply(reply) => reply,
                Dispatch::PeerGone => return CloseReason::PeerGoneWhileBlocked,
            };

            if logger.enabled(LogLevel::Verbose) {
                logger.log(
                    LogLevel::Verbose,
                    Some(LOG_CONTEXT),
                    "request served",
                    Some(json!({
                        "connection_id": self.connection_id,
                        "command": command.name(),
                        "reply": reply.label(),
                    })),
                );
            }

            if let Err(error) = codec.write_frame(&mut writer, &reply.into_raw()) {
                logger.debug(Some(LOG_CONTEXT), &format!("write failed: {error}"));
                return CloseReason::WriteFailed;
            }
        }
    }
}
