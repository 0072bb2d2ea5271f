use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::logging::Logger;
use crate::wire::codec::{FrameRead, WireCodec};
use crate::wire::message::{Command, Reply, Request};

const LOG_CONTEXT: &str = "client";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Reconnect on a failed liveness check instead of staying disconnected.
    pub auto_reconnect: bool,
    /// Let construction succeed while the server is unreachable.
    pub pre_connect: bool,
    /// Introspection calls return neutral defaults instead of `Disconnected`.
    pub silence_err: bool,
    /// Bounds connecting and writing. Reads are never bounded, since a
    /// blocking `get` may legitimately wait forever.
    pub io_timeout: Option<Duration>,
}

#[derive(Debug)]
pub enum ClientError {
    Connect { address: String, source: io::Error },
    Disconnected { address: String },
    Rejected { reason: String },
    UnexpectedReply { command: Command, reply: &'static str },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { address, source } => {
                write!(f, "failed to connect to queue server {address}: {source}")
            }
            Self::Disconnected { address } => {
                write!(f, "queue server {address} is disconnected")
            }
            Self::Rejected { reason } => write!(f, "request rejected by server: {reason}"),
            Self::UnexpectedReply { command, reply } => {
                write!(f, "unexpected {reply} reply to {command}")
            }
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutResult {
    Stored,
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetResult<T = Vec<u8>> {
    Item(T),
    Empty,
}

/// Blocking request/reply client for one queue server. Timeouts are in
/// milliseconds and are sent as given, so the server decides what is valid.
pub struct QueueClient {
    address: String,
    options: ClientOptions,
    codec: WireCodec,
    stream: Option<TcpStream>,
    logger: Arc<Logger>,
}

impl QueueClient {
    pub fn connect(host: &str, port: u16, options: ClientOptions) -> Result<Self, ClientError> {
        let address = format!("{host}:{port}");
        let stream = match open_stream(&address, options.io_timeout) {
            Ok(stream) => Some(stream),
            Err(_) if options.pre_connect => None,
            Err(source) => return Err(ClientError::Connect { address, source }),
        };

        Ok(Self {
            address,
            options,
            codec: WireCodec::default(),
            stream,
            logger: Arc::new(Logger::disabled()),
        })
    }

    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> ClientOptions {
        self.options
    }

    pub fn put(
        &mut self,
        item: Vec<u8>,
        block: bool,
        timeout_ms: Option<i64>,
    ) -> Result<PutResult, ClientError> {
        self.ensure_connected();
        match self.round_trip(Request::put(item, block, timeout_ms))? {
            Reply::Ok => Ok(PutResult::Stored),
            Reply::Full => Ok(PutResult::Full),
            other => Err(unexpected(Command::Put, other)),
        }
    }

    pub fn put_str(
        &mut self,
        item: &str,
        block: bool,
        timeout_ms: Option<i64>,
    ) -> Result<PutResult, ClientError> {
        self.put(item.as_bytes().to_vec(), block, timeout_ms)
    }

    pub fn get(&mut self, block: bool, timeout_ms: Option<i64>) -> Result<GetResult, ClientError> {
        self.ensure_connected();
        match self.round_trip(Request::get(block, timeout_ms))? {
            Reply::Item(item) => Ok(GetResult::Item(item)),
            Reply::Empty => Ok(GetResult::Empty),
            other => Err(unexpected(Command::Get, other)),
        }
    }

    pub fn get_with<T, F>(
        &mut self,
        block: bool,
        timeout_ms: Option<i64>,
        convert: F,
    ) -> Result<GetResult<T>, ClientError>
    where
        F: FnOnce(Vec<u8>) -> T,
    {
        Ok(match self.get(block, timeout_ms)? {
            GetResult::Item(item) => GetResult::Item(convert(item)),
            GetResult::Empty => GetResult::Empty,
        })
    }

    pub fn full(&mut self) -> Result<bool, ClientError> {
        self.introspect(Command::QueryStatus, false, |reply| match reply {
            Reply::Full => Some(true),
            Reply::Ok | Reply::Empty => Some(false),
            _ => None,
        })
    }

    pub fn empty(&mut self) -> Result<bool, ClientError> {
        self.introspect(Command::QueryStatus, true, |reply| match reply {
            Reply::Empty => Some(true),
            Reply::Ok | Reply::Full => Some(false),
            _ => None,
        })
    }

    pub fn size(&mut self) -> Result<u64, ClientError> {
        self.introspect(Command::Size, 0, count)
    }

    pub fn capacity(&mut self) -> Result<u64, ClientError> {
        self.introspect(Command::MaxSize, 0, count)
    }

    pub fn connected_clients(&mut self) -> Result<u64, ClientError> {
        self.introspect(Command::Clients, 0, count)
    }

    pub fn reset(&mut self, new_capacity: i64) -> Result<bool, ClientError> {
        self.ensure_connected();
        match self.round_trip(Request::reset(new_capacity)) {
            Ok(Reply::Ok) => Ok(true),
            Ok(other) => Err(unexpected(Command::Reset, other)),
            Err(ClientError::Disconnected { .. }) if self.options.silence_err => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// PING round trip. With `auto_reconnect`, a failed check is followed by a
    /// fresh connection attempt whose outcome is returned.
    pub fn connected(&mut self) -> bool {
        match self.round_trip(Request::new(Command::Ping)) {
            Ok(reply) => reply == Reply::Pong,
            Err(_) if self.options.auto_reconnect => self.reconnect(),
            Err(_) => false,
        }
    }

    pub fn ping(&mut self) -> Result<(), ClientError> {
        match self.round_trip(Request::new(Command::Ping))? {
            Reply::Pong => Ok(()),
            other => Err(unexpected(Command::Ping, other)),
        }
    }

    /// Closes this client's connection; the server keeps running.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn helper(&self) -> String {
        let state = if self.stream.is_some() {
            "connected"
        } else {
            "disconnected"
        };
        format!(
            "QueueClient for {} ({state})\n\
             options: auto_reconnect={} pre_connect={} silence_err={} io_timeout={:?}\n\
             calls: put, put_str, get, get_with, full, empty, size, capacity, \
             reset, connected_clients, connected, ping, close",
            self.address,
            self.options.auto_reconnect,
            self.options.pre_connect,
            self.options.silence_err,
            self.options.io_timeout,
        )
    }

    fn ensure_connected(&mut self) {
        if self.options.auto_reconnect {
            self.connected();
        }
    }

    fn reconnect(&mut self) -> bool {
        self.close();
        match open_stream(&self.address, self.options.io_timeout) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.logger
                    .info(Some(LOG_CONTEXT), &format!("reconnected to {}", self.address));
                true
            }
            Err(error) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("reconnect to {} failed: {error}", self.address),
                );
                false
            }
        }
    }

    fn introspect<T>(
        &mut self,
        command: Command,
        fallback: T,
        interpret: impl FnOnce(&Reply) -> Option<T>,
    ) -> Result<T, ClientError> {
        self.ensure_connected();
        match self.round_trip(Request::new(command)) {
            Ok(reply) => interpret(&reply).ok_or_else(|| unexpected(command, reply)),
            Err(ClientError::Disconnected { .. }) if self.options.silence_err => Ok(fallback),
            Err(error) => Err(error),
        }
    }

    // Any transport or decode failure drops the stream, so every later call
    // reports `Disconnected` until a reconnect succeeds.
    fn round_trip(&mut self, request: Request) -> Result<Reply, ClientError> {
        let disconnected = || ClientError::Disconnected {
            address: self.address.clone(),
        };
        let Some(stream) = self.stream.as_mut() else {
            return Err(disconnected());
        };

        let command = request.command;
        let exchanged = self
            .codec
            .write_frame(stream, &request.into_raw())
            .and_then(|()| self.codec.read_frame(stream));

        let reply = match exchanged {
            Ok(FrameRead::Frame(raw)) => Reply::from_raw(&raw).ok(),
            Ok(FrameRead::Closed) => None,
            Err(error) => {
                self.logger
                    .debug(Some(LOG_CONTEXT), &format!("{command} round trip failed: {error}"));
                None
            }
        };

        match reply {
            Some(Reply::Rejected(reason)) => Err(ClientError::Rejected { reason }),
            Some(reply) => Ok(reply),
            None => {
                let error = disconnected();
                self.close();
                Err(error)
            }
        }
    }
}

impl Drop for QueueClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueClient")
            .field("address", &self.address)
            .field("options", &self.options)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

fn count(reply: &Reply) -> Option<u64> {
    match reply {
        Reply::Count(value) => Some(*value),
        _ => None,
    }
}

fn unexpected(command: Command, reply: Reply) -> ClientError {
    ClientError::UnexpectedReply {
        command,
        reply: reply.label(),
    }
}

fn open_stream(address: &str, io_timeout: Option<Duration>) -> io::Result<TcpStream> {
    let stream = match io_timeout {
        None => TcpStream::connect(address)?,
        Some(timeout) => {
            let mut last_error = None;
            let mut connected = None;
            for candidate in address.to_socket_addrs()? {
                match TcpStream::connect_timeout(&candidate, timeout) {
                    Ok(stream) => {
                        connected = Some(stream);
                        break;
                    }
                    Err(error) => last_error = Some(error),
                }
            }
            match connected {
                Some(stream) => stream,
                None => {
                    return Err(last_error.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
                    }))
                }
            }
        }
    };

    stream.set_nodelay(true)?;
    stream.set_write_timeout(io_timeout)?;
    Ok(stream)
}
