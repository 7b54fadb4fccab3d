//! The abstract event-queue contract: everything the agent runtime and
//! environment need from a dispatcher, without committing to a concrete
//! scheduling policy.
//!
//! Concrete dispatchers (thread-per-agent, fixed pool, work-stealing pool)
//! are a named non-goal beyond the one reference implementation kept for
//! integration tests (`dispatch::thread_pool`). Grounded on
//! `lumen-runtime/src/scheduler.rs`'s `Task`/`Injector` split: the trait
//! below abstracts over exactly the push endpoint that code's
//! `Injector::push` exposes, so a caller can swap in any scheduler that
//! implements it.

use std::fmt;

use crate::ids::AgentId;

/// One unit of work pushed onto an agent's event queue: either "run this
/// agent's demand queue" or one of the two lifecycle bookends.
pub enum Event {
    /// Run `evt_start` for this agent. Pushed exactly once, before any
    /// ordinary demand.
    Start(AgentId),
    /// Drain and process pending demands for this agent.
    Demand(AgentId),
    /// Run `evt_finish` for this agent. Pushed exactly once, after the
    /// agent's coop has begun deregistering and no further demands will be
    /// pushed.
    Finish(AgentId),
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Start(id) => write!(f, "Event::Start({id:?})"),
            Event::Demand(id) => write!(f, "Event::Demand({id:?})"),
            Event::Finish(id) => write!(f, "Event::Finish({id:?})"),
        }
    }
}

/// The push endpoint every dispatcher must expose. The agent runtime and
/// the mailbox fabric hold a `dyn EventQueue` (via `Arc`) rather than a
/// concrete scheduler type, so tests can install a trivial single-threaded
/// queue while production code installs `dispatch::thread_pool`.
pub trait EventQueue: Send + Sync {
    /// Push a unit of work. Implementations must preserve per-agent FIFO
    /// order among `Demand` events for the same `AgentId` (spec §8,
    /// invariant "individual FIFO") but may interleave events belonging to
    /// different agents freely.
    fn push(&self, event: Event);

    /// Push the one-time `evt_start` event for an agent.
    fn push_evt_start(&self, agent: AgentId) {
        self.push(Event::Start(agent));
    }

    /// Push the one-time `evt_finish` event for an agent.
    fn push_evt_finish(&self, agent: AgentId) {
        self.push(Event::Finish(agent));
    }
}

/// A hook installed on an `EventQueue` to observe pushes without
/// participating in scheduling — used by the delivery-trace facility (spec
/// §7) to record "pushed to queue" as one hop in a message's trace, and by
/// tests asserting ordering invariants.
pub trait EventQueueHook: Send + Sync {
    fn on_push(&self, event: &Event);
}

/// Wraps any `EventQueue` with an observer hook invoked before each push is
/// forwarded to the inner queue.
pub struct ObservedEventQueue<Q> {
    inner: Q,
    hook: Box<dyn EventQueueHook>,
}

impl<Q: EventQueue> ObservedEventQueue<Q> {
    pub fn new(inner: Q, hook: Box<dyn EventQueueHook>) -> Self {
        Self { inner, hook }
    }
}

impl<Q: EventQueue> EventQueue for ObservedEventQueue<Q> {
    fn push(&self, event: Event) {
        self.hook.on_push(&event);
        self.inner.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingQueue {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl EventQueue for RecordingQueue {
        fn push(&self, event: Event) {
            self.log.lock().push(format!("{event:?}"));
        }
    }

    struct CountingHook {
        count: Arc<Mutex<usize>>,
    }

    impl EventQueueHook for CountingHook {
        fn on_push(&self, _event: &Event) {
            *self.count.lock() += 1;
        }
    }

    // === 1. push_evt_start/finish route through push ===
    #[test]
    fn start_and_finish_route_through_push() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = RecordingQueue { log: Arc::clone(&log) };
        let agent = AgentId::next();
        queue.push_evt_start(agent);
        queue.push_evt_finish(agent);
        let entries = log.lock();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("Event::Start"));
        assert!(entries[1].starts_with("Event::Finish"));
    }

    // === 2. ObservedEventQueue invokes the hook before forwarding ===
    #[test]
    fn observed_queue_invokes_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(Mutex::new(0));
        let inner = RecordingQueue { log: Arc::clone(&log) };
        let hook = Box::new(CountingHook { count: Arc::clone(&count) });
        let observed = ObservedEventQueue::new(inner, hook);
        observed.push(Event::Demand(AgentId::next()));
        assert_eq!(*count.lock(), 1);
        assert_eq!(log.lock().len(), 1);
    }
}
