use std::time::Duration;

use crate::queue::{BlockingQueue, GetOutcome, LivenessProbe, PutOutcome, QueueStatus, WaitPolicy};
use crate::registry::ConnectionRegistry;
use crate::wire::message::{Command, Reply, Request};

/// What the handler should do after a request has been run.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Reply(Reply),
    /// The peer left while the request was blocked; nothing is written back.
    PeerGone,
}

/// Runs one decoded request against the engine. Caller mistakes come back as
/// `Reply::Rejected` before the queue is touched.
pub fn dispatch(
    request: Request,
    queue: &BlockingQueue,
    registry: &ConnectionRegistry,
    probe: &dyn LivenessProbe,
) -> Dispatch {
    match request.command {
        Command::Put => {
            let wait = match wait_policy(&request) {
                Ok(wait) => wait,
                Err(reason) => return Dispatch::Reply(Reply::Rejected(reason)),
            };
            let Some(item) = request.payload else {
                return Dispatch::Reply(Reply::Rejected("PUT requires a data payload".to_owned()));
            };

            match queue.put_watched(item, wait, probe) {
                PutOutcome::Ok => Dispatch::Reply(Reply::Ok),
                PutOutcome::Full => Dispatch::Reply(Reply::Full),
                PutOutcome::Cancelled => Dispatch::PeerGone,
            }
        }
        Command::Get => {
            let wait = match wait_policy(&request) {
                Ok(wait) => wait,
                Err(reason) => return Dispatch::Reply(Reply::Rejected(reason)),
            };

            match queue.get_watched(wait, probe) {
                GetOutcome::Item(item) => Dispatch::Reply(Reply::Item(item)),
                GetOutcome::Empty => Dispatch::Reply(Reply::Empty),
                GetOutcome::Cancelled => Dispatch::PeerGone,
            }
        }
        Command::Ping => Dispatch::Reply(Reply::Pong),
        Command::QueryStatus => Dispatch::Reply(match queue.status() {
            QueueStatus::Full => Reply::Full,
            QueueStatus::Empty => Reply::Empty,
            QueueStatus::Available => Reply::Ok,
        }),
        Command::Size => Dispatch::Reply(Reply::Count(queue.size() as u64)),
        Command::MaxSize => Dispatch::Reply(Reply::Count(queue.capacity() as u64)),
        Command::Reset => {
            let Some(max_size) = request.max_size() else {
                return Dispatch::Reply(Reply::Rejected("RESET requires max_size".to_owned()));
            };
            match usize::try_from(max_size) {
                Ok(capacity) => {
                    queue.reset(capacity);
                    Dispatch::Reply(Reply::Ok)
                }
                Err(_) => Dispatch::Reply(Reply::Rejected(format!(
                    "max_size must be non-negative, got {max_size}"
                ))),
            }
        }
        Command::Clients => Dispatch::Reply(Reply::Count(registry.count() as u64)),
    }
}

// A negative timeout only matters for blocking calls; `block = false` never
// looks at it.
fn wait_policy(request: &Request) -> Result<WaitPolicy, String> {
    let block = request.block();
    let timeout = match request.timeout_ms() {
        Some(ms) if block && ms < 0 => {
            return Err(format!("timeout must be non-negative, got {ms}"));
        }
        Some(ms) => Some(Duration::from_millis(ms.max(0) as u64)),
        None => None,
    };
    Ok(WaitPolicy::from_args(block, timeout))
}
