use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::server::PersistentConnection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    ConnectionNotFound { connection_id: u64 },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound { connection_id } => {
                write!(f, "connection {connection_id} is not registered")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub connection: Arc<PersistentConnection>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub peer_addr: String,
    pub connected_at: String,
    pub last_seen_at: String,
    pub idle_ms: i64,
}

impl ConnectionEntry {
    fn snapshot(&self, now: DateTime<Utc>) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            peer_addr: self.peer_addr.to_string(),
            connected_at: self.connected_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            last_seen_at: self.last_seen_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            idle_ms: (now - self.last_seen_at).num_milliseconds().max(0),
        }
    }
}

/// The set of live client connections. Its lock is never held while the
/// queue lock is taken, and the other way round.
#[derive(Debug)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, ConnectionEntry>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, peer_addr: SocketAddr, connection: Arc<PersistentConnection>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        self.entries().insert(
            id,
            ConnectionEntry {
                id,
                peer_addr,
                connected_at: now,
                last_seen_at: now,
                connection,
            },
        );
        id
    }

    pub fn unregister(&self, connection_id: u64) -> Result<ConnectionEntry, RegistryError> {
        self.entries()
            .remove(&connection_id)
            .ok_or(RegistryError::ConnectionNotFound { connection_id })
    }

    pub fn touch(&self, connection_id: u64) -> Result<(), RegistryError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(&connection_id)
            .ok_or(RegistryError::ConnectionNotFound { connection_id })?;
        entry.last_seen_at = Utc::now();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.entries().len()
    }

    pub fn snapshot(&self, connection_id: u64) -> Option<ConnectionSnapshot> {
        let now = Utc::now();
        self.entries()
            .get(&connection_id)
            .map(|entry| entry.snapshot(now))
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let now = Utc::now();
        let mut snapshots = self
            .entries()
            .values()
            .map(|entry| entry.snapshot(now))
            .collect::<Vec<_>>();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    /// Shuts down every registered socket and returns how many there were.
    /// Entries stay until their handlers unregister on the way out.
    pub fn shutdown_all(&self) -> usize {
        let connections = self
            .entries()
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect::<Vec<_>>();

        for connection in &connections {
            let _ = connection.shutdown();
        }
        connections.len()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, ConnectionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    use crate::server::PersistentConnection;

    use super::{ConnectionRegistry, RegistryError};

    fn accepted_connection() -> (TcpStream, Arc<PersistentConnection>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let client =
            TcpStream::connect(listener.local_addr().expect("addr")).expect("client connects");
        let (stream, peer_addr) = listener.accept().expect("accept");
        let connection = PersistentConnection::new(stream, peer_addr).expect("configure");
        (client, Arc::new(connection))
    }

    #[test]
    fn register_assigns_increasing_ids_and_counts() {
        let registry = ConnectionRegistry::new();
        let (_c1, first) = accepted_connection();
        let (_c2, second) = accepted_connection();

        let a = registry.register(first.peer_addr(), first);
        let b = registry.register(second.peer_addr(), second);

        assert!(b > a);
        assert_eq!(registry.count(), 2);
        let ids = registry
            .snapshots()
            .into_iter()
            .map(|snapshot| snapshot.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn unregister_removes_once() {
        let registry = ConnectionRegistry::new();
        let (_client, connection) = accepted_connection();
        let id = registry.register(connection.peer_addr(), connection);

        let entry = registry.unregister(id).expect("entry exists");
        assert_eq!(entry.id, id);
        assert_eq!(registry.count(), 0);
        assert_eq!(
            registry.unregister(id).expect_err("already removed"),
            RegistryError::ConnectionNotFound { connection_id: id }
        );
        assert!(registry.touch(id).is_err());
        assert!(registry.snapshot(id).is_none());
    }

    #[test]
    fn touch_refreshes_last_seen() {
        let registry = ConnectionRegistry::new();
        let (_client, connection) = accepted_connection();
        let id = registry.register(connection.peer_addr(), connection);
        let before = registry.snapshot(id).expect("snapshot");

        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.touch(id).expect("touch");
        let after = registry.snapshot(id).expect("snapshot");

        assert_eq!(before.connected_at, after.connected_at);
        assert!(after.last_seen_at >= before.last_seen_at);
    }

    #[test]
    fn shutdown_all_closes_sockets_but_keeps_entries() {
        let registry = ConnectionRegistry::new();
        let (mut client, connection) = accepted_connection();
        registry.register(connection.peer_addr(), connection);

        assert_eq!(registry.shutdown_all(), 1);
        assert_eq!(registry.count(), 1);

        let mut buffer = [0_u8; 1];
        assert_eq!(client.read(&mut buffer).expect("eof read"), 0);
    }
}
