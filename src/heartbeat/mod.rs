use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::logging::{LogLevel, Logger};
use crate::queue::BlockingQueue;
use crate::registry::ConnectionRegistry;

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;

const LOG_CONTEXT: &str = "heartbeat";
// Upper bound on how long `stop` waits for a sleeping worker to notice.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    Spawn(std::io::Error),
    JoinFailed,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "status heartbeat is already running"),
            Self::Spawn(source) => write!(f, "failed to spawn status heartbeat thread: {source}"),
            Self::JoinFailed => write!(f, "status heartbeat worker thread join failed"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

/// Periodically logs queue and connection figures at debug level.
pub struct StatusHeartbeat {
    pub started_at: DateTime<Utc>,
    interval: Duration,
    queue: Arc<BlockingQueue>,
    registry: Arc<ConnectionRegistry>,
    logger: Arc<Logger>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl StatusHeartbeat {
    pub fn new(
        interval_ms: u64,
        queue: Arc<BlockingQueue>,
        registry: Arc<ConnectionRegistry>,
        logger: Arc<Logger>,
    ) -> Result<Self, HeartbeatError> {
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
            return Err(HeartbeatError::InvalidInterval {
                provided_ms: interval_ms,
            });
        }

        Ok(Self {
            started_at: Utc::now(),
            interval: Duration::from_millis(interval_ms),
            queue,
            registry,
            logger,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn start(&mut self) -> Result<(), HeartbeatError> {
        if self.worker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let queue = Arc::clone(&self.queue);
        let registry = Arc::clone(&self.registry);
        let logger = Arc::clone(&self.logger);
        let interval = self.interval;
        let started = Instant::now();

        let worker = thread::Builder::new()
            .name("wukong-heartbeat".to_owned())
            .spawn(move || {
                let mut next_beat = Instant::now() + interval;
                while !stop_signal.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now < next_beat {
                        thread::sleep((next_beat - now).min(STOP_CHECK_SLICE));
                        continue;
                    }
                    next_beat += interval;
                    if !logger.enabled(LogLevel::Debug) {
                        continue;
                    }

                    logger.log(
                        LogLevel::Debug,
                        Some(LOG_CONTEXT),
                        "queue status",
                        Some(status_payload(&queue, &registry, started)),
                    );
                }
            })
            .map_err(HeartbeatError::Spawn)?;

        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| HeartbeatError::JoinFailed);
        }

        Ok(())
    }

    pub fn describe(&self) -> Value {
        json!({
            "started_at": self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval.as_millis() as u64,
        })
    }
}

impl Drop for StatusHeartbeat {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn status_payload(queue: &BlockingQueue, registry: &ConnectionRegistry, started: Instant) -> Value {
    let stats = queue.stats();
    json!({
        "size": stats.size,
        "capacity": stats.capacity,
        "clients": registry.count(),
        "blocked_putters": stats.blocked_putters,
        "blocked_getters": stats.blocked_getters,
        "uptime_ms": started.elapsed().as_millis() as u64,
        "connections": registry.snapshots(),
    })
}
