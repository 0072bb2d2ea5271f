//! Bounded blocking FIFO of opaque byte items.
//!
//! One mutex guards the items, the capacity and the waiter bookkeeping; the
//! `not_full` and `not_empty` condition variables park blocked putters and
//! getters. Blocked callers are served in arrival order per side. A reset bumps
//! the generation counter so that waiters parked before it re-evaluate once and
//! return a capacity signal instead of waiting again.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config;

pub const DEFAULT_MAX_SIZE: usize = 1024;
pub const DEFAULT_WAIT_POLL_INTERVAL_MS: u64 = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPolicy {
    NonBlocking,
    Forever,
    Timeout(Duration),
}

impl WaitPolicy {
    /// Maps the `block`/`timeout` argument pair. A zero timeout never waits,
    /// and `block = false` ignores the timeout.
    pub fn from_args(block: bool, timeout: Option<Duration>) -> Self {
        match (block, timeout) {
            (false, _) => Self::NonBlocking,
            (true, None) => Self::Forever,
            (true, Some(timeout)) if timeout.is_zero() => Self::NonBlocking,
            (true, Some(timeout)) => Self::Timeout(timeout),
        }
    }
}

/// Lets a blocked caller be abandoned when whoever asked for it is gone.
pub trait LivenessProbe {
    fn is_peer_gone(&self) -> bool;
}

pub struct AlwaysAlive;

impl LivenessProbe for AlwaysAlive {
    fn is_peer_gone(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Ok,
    Full,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetOutcome {
    Item(Vec<u8>),
    Empty,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Full,
    Empty,
    Available,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub blocked_putters: usize,
    pub blocked_getters: usize,
    pub resets: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_size: usize,
    pub wait_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            wait_poll_interval: Duration::from_millis(DEFAULT_WAIT_POLL_INTERVAL_MS),
        }
    }
}

impl From<&config::QueueConfig> for QueueConfig {
    fn from(value: &config::QueueConfig) -> Self {
        Self {
            max_size: value.max_size,
            wait_poll_interval: Duration::from_millis(value.wait_poll_interval_ms.max(1)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Put,
    Get,
}

enum Acquired {
    Ready,
    Unavailable,
    Cancelled,
}

struct QueueState {
    items: VecDeque<Vec<u8>>,
    capacity: usize,
    generation: u64,
    next_ticket: u64,
    put_waiters: VecDeque<u64>,
    get_waiters: VecDeque<u64>,
}

impl QueueState {
    fn ready(&self, side: Side) -> bool {
        match side {
            Side::Put => self.items.len() < self.capacity,
            Side::Get => !self.items.is_empty(),
        }
    }

    fn waiters(&mut self, side: Side) -> &mut VecDeque<u64> {
        match side {
            Side::Put => &mut self.put_waiters,
            Side::Get => &mut self.get_waiters,
        }
    }

    fn enqueue_waiter(&mut self, side: Side) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.waiters(side).push_back(ticket);
        ticket
    }

    fn withdraw(&mut self, side: Side, ticket: u64) {
        self.waiters(side).retain(|waiting| *waiting != ticket);
    }
}

pub struct BlockingQueue {
    state: Mutex<QueueState>,
    not_full: Condvar,
    not_empty: Condvar,
    wait_poll_interval: Duration,
}

impl fmt::Debug for BlockingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("BlockingQueue")
            .field("size", &stats.size)
            .field("capacity", &stats.capacity)
            .field("wait_poll_interval", &self.wait_poll_interval)
            .finish()
    }
}

impl BlockingQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity: config.max_size,
                generation: 0,
                next_ticket: 0,
                put_waiters: VecDeque::new(),
                get_waiters: VecDeque::new(),
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            wait_poll_interval: config.wait_poll_interval,
        }
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self::new(QueueConfig {
            max_size,
            ..QueueConfig::default()
        })
    }

    pub fn put(&self, item: Vec<u8>, wait: WaitPolicy) -> PutOutcome {
        self.put_watched(item, wait, &AlwaysAlive)
    }

    /// Like [`BlockingQueue::put`], but a blocked wait is abandoned once
    /// `probe` reports the peer gone. The item is never enqueued in that case.
    pub fn put_watched(
        &self,
        item: Vec<u8>,
        wait: WaitPolicy,
        probe: &dyn LivenessProbe,
    ) -> PutOutcome {
        let (mut state, acquired) = self.acquire(Side::Put, wait, probe);
        match acquired {
            Acquired::Ready => {
                state.items.push_back(item);
                drop(state);
                self.not_empty.notify_all();
                PutOutcome::Ok
            }
            Acquired::Unavailable => PutOutcome::Full,
            Acquired::Cancelled => PutOutcome::Cancelled,
        }
    }

    pub fn get(&self, wait: WaitPolicy) -> GetOutcome {
        self.get_watched(wait, &AlwaysAlive)
    }

    /// Like [`BlockingQueue::get`], but a blocked wait is abandoned once
    /// `probe` reports the peer gone. No item is consumed in that case.
    pub fn get_watched(&self, wait: WaitPolicy, probe: &dyn LivenessProbe) -> GetOutcome {
        let (mut state, acquired) = self.acquire(Side::Get, wait, probe);
        match acquired {
            Acquired::Ready => match state.items.pop_front() {
                Some(item) => {
                    drop(state);
                    self.not_full.notify_all();
                    GetOutcome::Item(item)
                }
                None => GetOutcome::Empty,
            },
            Acquired::Unavailable => GetOutcome::Empty,
            Acquired::Cancelled => GetOutcome::Cancelled,
        }
    }

    /// Drops every item and installs `new_capacity`. Returns how many items
    /// were discarded. Every blocked caller is woken to re-evaluate.
    pub fn reset(&self, new_capacity: usize) -> usize {
        let mut state = self.lock_state();
        let dropped = state.items.len();
        state.items.clear();
        state.items.shrink_to_fit();
        state.capacity = new_capacity;
        state.generation = state.generation.wrapping_add(1);
        drop(state);

        self.not_full.notify_all();
        self.not_empty.notify_all();
        dropped
    }

    pub fn size(&self) -> usize {
        self.lock_state().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.lock_state().capacity
    }

    pub fn is_full(&self) -> bool {
        !self.lock_state().ready(Side::Put)
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().items.is_empty()
    }

    /// Single-lock status probe. A zero-capacity queue reports `Full`.
    pub fn status(&self) -> QueueStatus {
        let state = self.lock_state();
        if !state.ready(Side::Put) {
            QueueStatus::Full
        } else if state.items.is_empty() {
            QueueStatus::Empty
        } else {
            QueueStatus::Available
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            size: state.items.len(),
            capacity: state.capacity,
            blocked_putters: state.put_waiters.len(),
            blocked_getters: state.get_waiters.len(),
            resets: state.generation,
        }
    }

    // Every mutation leaves the state consistent, so a panic in another
    // holder does not invalidate it.
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn condvar(&self, side: Side) -> &Condvar {
        match side {
            Side::Put => &self.not_full,
            Side::Get => &self.not_empty,
        }
    }

    fn acquire(
        &self,
        side: Side,
        wait: WaitPolicy,
        probe: &dyn LivenessProbe,
    ) -> (MutexGuard<'_, QueueState>, Acquired) {
        let mut state = self.lock_state();
        let deadline = match wait {
            WaitPolicy::NonBlocking => {
                let acquired = if state.ready(side) {
                    Acquired::Ready
                } else {
                    Acquired::Unavailable
                };
                return (state, acquired);
            }
            WaitPolicy::Forever => None,
            WaitPolicy::Timeout(timeout) => Some(Instant::now() + timeout),
        };

        if state.ready(side) && state.waiters(side).is_empty() {
            return (state, Acquired::Ready);
        }

        let ticket = state.enqueue_waiter(side);
        let generation = state.generation;
        let condvar = self.condvar(side);
        let mut probed_at = Instant::now();

        loop {
            if state.waiters(side).front() == Some(&ticket) {
                if state.ready(side) {
                    return self.leave(state, side, ticket, Acquired::Ready);
                }
                if state.generation != generation {
                    return self.leave(state, side, ticket, Acquired::Unavailable);
                }
            }

            if probed_at.elapsed() >= self.wait_poll_interval {
                // The probe may touch the socket or the queue; run it unlocked
                // and look at the state again afterwards.
                drop(state);
                let gone = probe.is_peer_gone();
                state = self.lock_state();
                probed_at = Instant::now();
                if gone {
                    return self.leave(state, side, ticket, Acquired::Cancelled);
                }
                continue;
            }

            let until_probe = self.wait_poll_interval.saturating_sub(probed_at.elapsed());
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.leave(state, side, ticket, Acquired::Unavailable);
                    }
                    (deadline - now).min(until_probe)
                }
                None => until_probe,
            };

            state = match condvar.wait_timeout(state, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    // Drops the ticket and lets the next waiter on the same side look again.
    fn leave<'a>(
        &self,
        mut state: MutexGuard<'a, QueueState>,
        side: Side,
        ticket: u64,
        acquired: Acquired,
    ) -> (MutexGuard<'a, QueueState>, Acquired) {
        state.withdraw(side, ticket);
        self.condvar(side).notify_all();
        (state, acquired)
    }
}

impl Default for BlockingQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{
        BlockingQueue, GetOutcome, LivenessProbe, PutOutcome, QueueConfig, QueueStatus,
        WaitPolicy,
    };

    fn queue(max_size: usize) -> Arc<BlockingQueue> {
        Arc::new(BlockingQueue::new(QueueConfig {
            max_size,
            wait_poll_interval: Duration::from_millis(20),
        }))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let started = Instant::now();
        while !condition() {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "condition not reached in time"
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    struct FlagProbe(Arc<AtomicBool>);

    impl LivenessProbe for FlagProbe {
        fn is_peer_gone(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn wait_policy_maps_block_and_timeout() {
        assert_eq!(WaitPolicy::from_args(false, None), WaitPolicy::NonBlocking);
        assert_eq!(
            WaitPolicy::from_args(false, Some(Duration::from_secs(3))),
            WaitPolicy::NonBlocking
        );
        assert_eq!(WaitPolicy::from_args(true, None), WaitPolicy::Forever);
        assert_eq!(
            WaitPolicy::from_args(true, Some(Duration::ZERO)),
            WaitPolicy::NonBlocking
        );
        assert_eq!(
            WaitPolicy::from_args(true, Some(Duration::from_millis(5))),
            WaitPolicy::Timeout(Duration::from_millis(5))
        );
    }

    #[test]
    fn capacity_two_walkthrough() {
        let q = queue(2);

        assert_eq!(q.put(b"a".to_vec(), WaitPolicy::Forever), PutOutcome::Ok);
        assert_eq!(q.put(b"b".to_vec(), WaitPolicy::Forever), PutOutcome::Ok);
        assert_eq!(q.put(b"c".to_vec(), WaitPolicy::NonBlocking), PutOutcome::Full);
        assert_eq!(q.get(WaitPolicy::Forever), GetOutcome::Item(b"a".to_vec()));
        assert_eq!(q.put(b"c".to_vec(), WaitPolicy::NonBlocking), PutOutcome::Ok);
        assert_eq!(q.get(WaitPolicy::Forever), GetOutcome::Item(b"b".to_vec()));
        assert_eq!(q.get(WaitPolicy::Forever), GetOutcome::Item(b"c".to_vec()));
        assert_eq!(q.get(WaitPolicy::NonBlocking), GetOutcome::Empty);
    }

    #[test]
    fn items_leave_in_insertion_order() {
        let q = queue(16);
        for item in ["first", "second", "third"] {
            assert_eq!(q.put(item.as_bytes().to_vec(), WaitPolicy::NonBlocking), PutOutcome::Ok);
        }

        for expected in ["first", "second", "third"] {
            assert_eq!(
                q.get(WaitPolicy::NonBlocking),
                GetOutcome::Item(expected.as_bytes().to_vec())
            );
        }
    }

    #[test]
    fn full_put_does_not_mutate_state() {
        let q = queue(1);
        assert_eq!(q.put(b"kept".to_vec(), WaitPolicy::NonBlocking), PutOutcome::Ok);
        assert_eq!(q.put(b"dropped".to_vec(), WaitPolicy::NonBlocking), PutOutcome::Full);
        let zero_timeout = WaitPolicy::from_args(true, Some(Duration::ZERO));
        assert_eq!(q.put(b"dropped".to_vec(), zero_timeout), PutOutcome::Full);

        assert_eq!(q.size(), 1);
        assert!(q.is_full());
        assert_eq!(q.get(WaitPolicy::NonBlocking), GetOutcome::Item(b"kept".to_vec()));
    }

    #[test]
    fn zero_capacity_is_always_full_and_empty() {
        let q = queue(0);

        assert_eq!(q.put(b"x".to_vec(), WaitPolicy::NonBlocking), PutOutcome::Full);
        assert_eq!(
            q.put(b"x".to_vec(), WaitPolicy::Timeout(Duration::from_millis(30))),
            PutOutcome::Full
        );
        assert_eq!(q.get(WaitPolicy::NonBlocking), GetOutcome::Empty);
        assert!(q.is_full());
        assert!(q.is_empty());
        assert_eq!(q.status(), QueueStatus::Full);
    }

    #[test]
    fn status_reports_each_state() {
        let q = queue(2);
        assert_eq!(q.status(), QueueStatus::Empty);
        q.put(b"1".to_vec(), WaitPolicy::NonBlocking);
        assert_eq!(q.status(), QueueStatus::Available);
        q.put(b"2".to_vec(), WaitPolicy::NonBlocking);
        assert_eq!(q.status(), QueueStatus::Full);
    }

    #[test]
    fn timed_get_waits_at_least_the_timeout() {
        let q = queue(4);
        let timeout = Duration::from_millis(120);

        let started = Instant::now();
        assert_eq!(q.get(WaitPolicy::Timeout(timeout)), GetOutcome::Empty);
        let elapsed = started.elapsed();

        assert!(elapsed >= timeout, "returned after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_secs(1), "returned after {elapsed:?}");
        assert_eq!(q.stats().blocked_getters, 0);
    }

    #[test]
    fn timed_put_reports_full_after_timeout() {
        let q = queue(1);
        q.put(b"occupant".to_vec(), WaitPolicy::NonBlocking);

        let started = Instant::now();
        let outcome = q.put(b"late".to_vec(), WaitPolicy::Timeout(Duration::from_millis(80)));

        assert_eq!(outcome, PutOutcome::Full);
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn blocked_get_completes_after_concurrent_put() {
        let q = queue(4);
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.get(WaitPolicy::Forever))
        };

        wait_until(|| q.stats().blocked_getters == 1);
        assert_eq!(q.put(b"late item".to_vec(), WaitPolicy::NonBlocking), PutOutcome::Ok);

        let outcome = consumer.join().expect("consumer thread should finish");
        assert_eq!(outcome, GetOutcome::Item(b"late item".to_vec()));
    }

    #[test]
    fn blocked_put_completes_after_concurrent_get() {
        let q = queue(1);
        q.put(b"first".to_vec(), WaitPolicy::NonBlocking);

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.put(b"second".to_vec(), WaitPolicy::Forever))
        };

        wait_until(|| q.stats().blocked_putters == 1);
        assert_eq!(q.get(WaitPolicy::NonBlocking), GetOutcome::Item(b"first".to_vec()));
        assert_eq!(producer.join().expect("producer thread should finish"), PutOutcome::Ok);
        assert_eq!(q.get(WaitPolicy::NonBlocking), GetOutcome::Item(b"second".to_vec()));
    }

    #[test]
    fn blocked_getters_are_served_in_arrival_order() {
        let q = queue(4);
        let (tx, rx) = mpsc::channel();

        let mut handles = Vec::new();
        for name in ["early", "late"] {
            let getter_queue = Arc::clone(&q);
            let tx = tx.clone();
            let expected_waiters = handles.len() + 1;
            handles.push(thread::spawn(move || {
                let outcome = getter_queue.get(WaitPolicy::Forever);
                tx.send((name, outcome)).expect("result channel open");
            }));
            wait_until(|| q.stats().blocked_getters == expected_waiters);
        }

        q.put(b"one".to_vec(), WaitPolicy::NonBlocking);
        q.put(b"two".to_vec(), WaitPolicy::NonBlocking);
        for handle in handles {
            handle.join().expect("getter thread should finish");
        }

        let mut results = rx.try_iter().collect::<Vec<_>>();
        results.sort_by_key(|(name, _)| *name);
        assert_eq!(
            results,
            vec![
                ("early", GetOutcome::Item(b"one".to_vec())),
                ("late", GetOutcome::Item(b"two".to_vec())),
            ]
        );
    }

    #[test]
    fn reset_clears_items_and_installs_capacity() {
        let q = queue(3);
        for item in [b"a", b"b", b"c"] {
            q.put(item.to_vec(), WaitPolicy::NonBlocking);
        }

        assert_eq!(q.reset(7), 3);
        assert_eq!(q.size(), 0);
        assert_eq!(q.capacity(), 7);
        assert_eq!(q.stats().resets, 1);
    }

    #[test]
    fn reset_lets_blocked_putter_land_in_new_queue() {
        let q = queue(1);
        q.put(b"old".to_vec(), WaitPolicy::NonBlocking);

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.put(b"new".to_vec(), WaitPolicy::Forever))
        };
        wait_until(|| q.stats().blocked_putters == 1);

        q.reset(2);
        assert_eq!(producer.join().expect("producer thread should finish"), PutOutcome::Ok);
        assert_eq!(q.get(WaitPolicy::NonBlocking), GetOutcome::Item(b"new".to_vec()));
    }

    #[test]
    fn reset_releases_waiters_that_still_cannot_proceed() {
        let q = queue(1);
        q.put(b"old".to_vec(), WaitPolicy::NonBlocking);

        let putter = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.put(b"never".to_vec(), WaitPolicy::Forever))
        };
        wait_until(|| q.stats().blocked_putters == 1);

        let empty = queue(1);
        let getter = {
            let empty = Arc::clone(&empty);
            thread::spawn(move || empty.get(WaitPolicy::Forever))
        };
        wait_until(|| empty.stats().blocked_getters == 1);

        q.reset(0);
        empty.reset(5);

        assert_eq!(putter.join().expect("putter should finish"), PutOutcome::Full);
        assert_eq!(getter.join().expect("getter should finish"), GetOutcome::Empty);
        assert_eq!(q.size(), 0);
        assert_eq!(empty.capacity(), 5);
    }

    #[test]
    fn waiters_arriving_after_reset_block_normally() {
        let q = queue(1);
        q.reset(1);

        let getter = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.get(WaitPolicy::Forever))
        };
        wait_until(|| q.stats().blocked_getters == 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(q.stats().blocked_getters, 1);

        q.put(b"fresh".to_vec(), WaitPolicy::NonBlocking);
        assert_eq!(
            getter.join().expect("getter should finish"),
            GetOutcome::Item(b"fresh".to_vec())
        );
    }

    #[test]
    fn departed_peer_abandons_wait_without_consuming() {
        let q = queue(2);
        let gone = Arc::new(AtomicBool::new(false));

        let getter = {
            let q = Arc::clone(&q);
            let probe = FlagProbe(Arc::clone(&gone));
            thread::spawn(move || q.get_watched(WaitPolicy::Forever, &probe))
        };
        wait_until(|| q.stats().blocked_getters == 1);

        gone.store(true, Ordering::SeqCst);
        assert_eq!(getter.join().expect("getter should finish"), GetOutcome::Cancelled);
        assert_eq!(q.stats().blocked_getters, 0);

        q.put(b"survivor".to_vec(), WaitPolicy::NonBlocking);
        assert_eq!(q.get(WaitPolicy::NonBlocking), GetOutcome::Item(b"survivor".to_vec()));
    }

    /// Reports the peer gone on its third call and notes whether the queue
    /// lock was held while it ran.
    struct QueueInspectingCheck {
        queue: Arc<BlockingQueue>,
        calls: AtomicUsize,
        ran_under_lock: AtomicBool,
    }

    impl LivenessProbe for QueueInspectingCheck {
        fn is_peer_gone(&self) -> bool {
            if self.queue.state.try_lock().is_err() {
                self.ran_under_lock.store(true, Ordering::SeqCst);
            }
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= 3
        }
    }

    #[test]
    fn liveness_checks_run_without_the_queue_lock() {
        let q = queue(1);
        let probe = Arc::new(QueueInspectingCheck {
            queue: Arc::clone(&q),
            calls: AtomicUsize::new(0),
            ran_under_lock: AtomicBool::new(false),
        });

        let getter = {
            let q = Arc::clone(&q);
            let probe = Arc::clone(&probe);
            thread::spawn(move || q.get_watched(WaitPolicy::Forever, &*probe))
        };

        assert_eq!(getter.join().expect("getter should finish"), GetOutcome::Cancelled);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(!probe.ran_under_lock.load(Ordering::SeqCst));
        assert_eq!(q.stats().blocked_getters, 0);
    }

    struct CountingCheck(AtomicUsize);

    impl LivenessProbe for CountingCheck {
        fn is_peer_gone(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[test]
    fn prompt_wakeups_skip_the_liveness_check() {
        let q = Arc::new(BlockingQueue::new(QueueConfig {
            max_size: 1,
            wait_poll_interval: Duration::from_secs(30),
        }));
        let probe = Arc::new(CountingCheck(AtomicUsize::new(0)));

        let getter = {
            let q = Arc::clone(&q);
            let probe = Arc::clone(&probe);
            thread::spawn(move || q.get_watched(WaitPolicy::Forever, &*probe))
        };
        wait_until(|| q.stats().blocked_getters == 1);

        assert_eq!(q.put(b"fresh".to_vec(), WaitPolicy::NonBlocking), PutOutcome::Ok);
        assert_eq!(
            getter.join().expect("getter should finish"),
            GetOutcome::Item(b"fresh".to_vec())
        );
        assert_eq!(probe.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn producers_and_consumers_neither_lose_nor_duplicate() {
        let q = queue(3);
        let producers = 8;
        let per_producer = 25;

        let producer_handles = (0..producers)
            .map(|producer| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for n in 0..per_producer {
                        let item = format!("{producer}-{n}").into_bytes();
                        assert_eq!(q.put(item, WaitPolicy::Forever), PutOutcome::Ok);
                    }
                })
            })
            .collect::<Vec<_>>();

        let consumer_handles = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let GetOutcome::Item(item) =
                        q.get(WaitPolicy::Timeout(Duration::from_millis(500)))
                    {
                        assert!(q.size() <= q.capacity());
                        seen.push(item);
                    }
                    seen
                })
            })
            .collect::<Vec<_>>();

        for handle in producer_handles {
            handle.join().expect("producer should finish");
        }
        let consumed = consumer_handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("consumer should finish"))
            .collect::<Vec<_>>();

        let unique = consumed.iter().cloned().collect::<HashSet<_>>();
        assert_eq!(consumed.len(), producers * per_producer);
        assert_eq!(unique.len(), consumed.len());
    }
}
