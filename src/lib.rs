//! A bounded, blocking FIFO of byte items shared between processes over TCP.
//!
//! The server side is [`server::TcpServer`] driving one
//! [`session::ConnectionHandler`] per client against a single
//! [`queue::BlockingQueue`]; [`client::QueueClient`] is the matching stub.

pub mod client;
pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod utils;
pub mod wire;
