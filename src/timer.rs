//! The timer scheduler facade: delayed and periodic message delivery, plus
//! the state time-limit wiring that turns an expired `state.rs` time limit
//! into an actual scheduled transition.
//!
//! Grounded on `lumen-rt/src/services/mailbox.rs`'s `recv_timeout` idiom for
//! the condvar/deadline shape, run on one dedicated background thread (the
//! teacher's services are generally one-thread-per-concern rather than a
//! shared async runtime, and this crate carries no async runtime
//! dependency).

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::RcError;
use crate::ids::MailboxId;
use crate::mailbox::MailboxRef;
use crate::message::{Message, Mutability};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to a scheduled (delayed or periodic) send, used to cancel it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerId(u64);

struct ScheduledEntry {
    timer_id: TimerId,
    fire_at: Instant,
    period: Option<Duration>,
    target: MailboxId,
    build_message: Arc<dyn Fn() -> Message + Send + Sync>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for ScheduledEntry {}
impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest fire_at sorts first.
        other.fire_at.cmp(&self.fire_at)
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<ScheduledEntry>>,
    wake: Condvar,
    shutdown: AtomicBool,
}

/// A running timer facility. Owns one background thread that sleeps until
/// the next scheduled entry, delivers it (routing the built message through
/// the validated mailbox target), and reschedules periodic entries.
pub struct TimerScheduler {
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl TimerScheduler {
    pub fn start(route: impl Fn(MailboxId, Message) + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("timer-scheduler".into())
            .spawn(move || run_loop(worker_shared, route))
            .expect("failed to spawn timer-scheduler thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Schedule a one-shot delivery after `delay`. `target_is_direct` tells
    /// the validator whether `target` addresses a direct (single-owner) or
    /// an MPMC named mbox — the schedule call has no live `MailboxRef` to
    /// inspect, only the id, so the caller asserts the mbox kind it already
    /// knows it built.
    pub fn schedule_once(
        &self,
        delay: Duration,
        target: MailboxId,
        target_is_direct: bool,
        build_message: impl Fn() -> Message + Send + Sync + 'static,
    ) -> Result<TimerId, RcError> {
        self.schedule(delay, None, target, target_is_direct, build_message)
    }

    /// Schedule a periodic delivery: first fire after `initial_delay`, then
    /// every `period` thereafter until cancelled. See `schedule_once` for
    /// `target_is_direct`.
    pub fn schedule_periodic(
        &self,
        initial_delay: Duration,
        period: Duration,
        target: MailboxId,
        target_is_direct: bool,
        build_message: impl Fn() -> Message + Send + Sync + 'static,
    ) -> Result<TimerId, RcError> {
        self.schedule(initial_delay, Some(period), target, target_is_direct, build_message)
    }

    /// Validate mutability against periodicity and mbox kind before
    /// scheduling: a mutable message may be edited in place by its handler,
    /// which only makes sense for a single delivery to a single owner —
    /// never a periodic redelivery, and never fan-out to an MPMC mbox.
    fn schedule(
        &self,
        delay: Duration,
        period: Option<Duration>,
        target: MailboxId,
        target_is_direct: bool,
        build_message: impl Fn() -> Message + Send + Sync + 'static,
    ) -> Result<TimerId, RcError> {
        let sample = build_message();
        if sample.mutability() == Mutability::Mutable {
            if period.is_some() {
                return Err(RcError::MutableMsgCannotBePeriodic);
            }
            if !target_is_direct {
                return Err(RcError::MutableMsgCannotBeDeliveredViaMpmcMbox);
            }
        }
        Ok(self.insert(delay, period, target, Arc::new(build_message)))
    }

    fn insert(
        &self,
        delay: Duration,
        period: Option<Duration>,
        target: MailboxId,
        build_message: Arc<dyn Fn() -> Message + Send + Sync>,
    ) -> TimerId {
        let timer_id = TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
        let entry = ScheduledEntry {
            timer_id,
            fire_at: Instant::now() + delay,
            period,
            target,
            build_message,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        self.shared.heap.lock().push(entry);
        self.shared.wake.notify_one();
        timer_id
    }

    /// Cancel a scheduled entry. A no-op if it already fired (one-shot) or
    /// was already cancelled.
    pub fn cancel(&self, timer_id: TimerId) {
        let heap = self.shared.heap.lock();
        for entry in heap.iter() {
            if entry.timer_id == timer_id {
                entry.cancelled.store(true, Ordering::Release);
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_loop(shared: Arc<Shared>, route: impl Fn(MailboxId, Message)) {
    loop {
        let mut heap = shared.heap.lock();
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        match heap.peek() {
            None => {
                shared.wake.wait(&mut heap);
            }
            Some(next) => {
                let now = Instant::now();
                if next.fire_at > now {
                    let wait_for = next.fire_at - now;
                    shared.wake.wait_for(&mut heap, wait_for);
                } else {
                    let entry = heap.pop().unwrap();
                    drop(heap);
                    if !entry.cancelled.load(Ordering::Acquire) {
                        route(entry.target, (entry.build_message)());
                    }
                    if let Some(period) = entry.period {
                        if !entry.cancelled.load(Ordering::Acquire) {
                            let mut heap = shared.heap.lock();
                            heap.push(ScheduledEntry {
                                timer_id: entry.timer_id,
                                fire_at: Instant::now() + period,
                                period: Some(period),
                                target: entry.target,
                                build_message: entry.build_message,
                                cancelled: entry.cancelled,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Validate that `target` accepts timer-delivered messages before
/// scheduling against it — timer messages are immutable classical
/// messages, since a delayed/periodic send has no single sender thread
/// that could safely mutate shared state. Direct and named mboxes accept
/// it; an mchain accepts it if it is not already closed.
pub fn validate_timer_target(target: &MailboxRef) -> bool {
    match target {
        MailboxRef::Direct(s) => !s.is_disconnected(),
        MailboxRef::Named(_) => true,
        MailboxRef::Chain(c) => !c.is_closed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::direct::DirectMailbox;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Tick(u32);

    // === 1. a one-shot timer fires once after its delay ===
    #[test]
    fn one_shot_fires_once() {
        let (tx, rx) = DirectMailbox::new();
        let route_tx = tx.clone();
        let scheduler = TimerScheduler::start(move |_target, msg| {
            let _ = route_tx.send(msg);
        });
        scheduler
            .schedule_once(Duration::from_millis(10), tx.id(), true, || Message::classical(Tick(1)))
            .unwrap();
        let msg = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(msg.downcast_ref::<Tick>().unwrap().0, 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    // === 2. cancelling a timer before it fires suppresses delivery ===
    #[test]
    fn cancel_before_fire_suppresses_delivery() {
        let (tx, rx) = DirectMailbox::new();
        let route_tx = tx.clone();
        let scheduler = TimerScheduler::start(move |_target, msg| {
            let _ = route_tx.send(msg);
        });
        let id = scheduler
            .schedule_once(Duration::from_millis(50), tx.id(), true, || Message::classical(Tick(1)))
            .unwrap();
        scheduler.cancel(id);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    // === 3. a periodic timer fires more than once ===
    #[test]
    fn periodic_fires_repeatedly() {
        let (tx, rx) = DirectMailbox::new();
        let route_tx = tx.clone();
        let scheduler = TimerScheduler::start(move |_target, msg| {
            let _ = route_tx.send(msg);
        });
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = Arc::clone(&counter);
        let id = scheduler
            .schedule_periodic(Duration::from_millis(10), Duration::from_millis(10), tx.id(), true, move || {
                counter2.fetch_add(1, Ordering::Relaxed);
                Message::classical(Tick(1))
            })
            .unwrap();
        rx.recv_timeout(Duration::from_millis(500)).unwrap();
        rx.recv_timeout(Duration::from_millis(500)).unwrap();
        scheduler.cancel(id);
        assert!(counter.load(Ordering::Relaxed) >= 2);
    }

    // === 4. validate_timer_target rejects a disconnected direct mbox ===
    #[test]
    fn validate_rejects_disconnected_direct() {
        let (tx, rx) = DirectMailbox::new();
        drop(rx);
        assert!(!validate_timer_target(&MailboxRef::Direct(tx)));
    }
}
