//! Process-unique identifiers and the small refcount/thread-guard primitives
//! the rest of the crate is built on.
//!
//! Every id in this module is minted from a dedicated `AtomicU64` counter —
//! no id space is shared between mailboxes, coops, and agents, so a stray
//! comparison across the wrong id type is a compile error rather than a
//! runtime surprise.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

macro_rules! monotonic_id {
    ($name:ident, $counter:ident, $prefix:literal) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        #[doc = concat!("A process-unique, monotonically increasing ", $prefix, " id.")]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Allocate the next unique id.
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// The raw numeric value, useful for tracing and hashing into
            /// external structures.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

monotonic_id!(MailboxId, NEXT_MAILBOX_ID, "mbox");
monotonic_id!(CoopId, NEXT_COOP_ID, "coop");
monotonic_id!(AgentId, NEXT_AGENT_ID, "agent");

/// An agent's registration priority: higher sorts first in a coop's agent
/// list and in an MPMC mailbox's subscriber fan-out order. Plain `i32`
/// rather than a newtype — it is compared and defaulted like any ordinary
/// numeric knob, never minted from a counter.
pub type Priority = i32;

// ---------------------------------------------------------------------------
// RefCount
// ---------------------------------------------------------------------------

/// A shared, atomic reference count with the increment/decrement semantics
/// the cooperation lifecycle needs: agents and child coops each hold one
/// increment, and the registration routine itself holds one extra
/// increment for its own duration so the coop cannot be destroyed while
/// `register()` is still unwinding the stack.
#[derive(Clone)]
pub struct RefCount(Arc<AtomicUsize>);

impl RefCount {
    /// Start a new counter at `initial`.
    pub fn new(initial: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(initial)))
    }

    /// Increment and return the new value.
    pub fn inc(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement and return the new value. Panics on underflow in debug
    /// builds — an extra decrement means a bookkeeping bug upstream, not a
    /// recoverable condition.
    pub fn dec(&self) -> usize {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "RefCount underflow");
        prev - 1
    }

    /// Current value. Only meaningful as a snapshot — the count may change
    /// concurrently.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

// ---------------------------------------------------------------------------
// WorkingThread
// ---------------------------------------------------------------------------

/// Tracks which OS thread, if any, is currently allowed to mutate an agent's
/// subscription storage: it is mutated only on the agent's working thread.
///
/// `None` means no thread currently holds working-thread status (outside an
/// active handler and outside `so_define_agent`).
pub struct WorkingThread(parking_lot::Mutex<Option<ThreadId>>);

impl WorkingThread {
    pub fn new() -> Self {
        Self(parking_lot::Mutex::new(None))
    }

    /// Mark the calling thread as the working thread.
    pub fn acquire(&self) {
        *self.0.lock() = Some(std::thread::current().id());
    }

    /// Clear working-thread status.
    pub fn release(&self) {
        *self.0.lock() = None;
    }

    /// `true` if the calling thread currently holds working-thread status.
    pub fn is_current(&self) -> bool {
        *self.0.lock() == Some(std::thread::current().id())
    }
}

impl Default for WorkingThread {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkingThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkingThread").field(&*self.0.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // === 1. ids are unique and monotonic within their own space ===
    #[test]
    fn mailbox_ids_are_unique_and_ordered() {
        let a = MailboxId::next();
        let b = MailboxId::next();
        assert_ne!(a, b);
        assert!(a.as_u64() < b.as_u64());
    }

    // === 2. distinct id spaces don't collide in meaning (type-level check) ===
    #[test]
    fn coop_and_agent_ids_are_distinct_types() {
        let coop = CoopId::next();
        let agent = AgentId::next();
        assert_eq!(format!("{}", coop).starts_with("coop:"), true);
        assert_eq!(format!("{}", agent).starts_with("agent:"), true);
    }

    // === 3. Display/Debug formatting ===
    #[test]
    fn display_and_debug_formats() {
        let id = MailboxId::next();
        assert!(format!("{}", id).starts_with("mbox:"));
        assert!(format!("{:?}", id).starts_with("MailboxId("));
    }

    // === 4. RefCount basic inc/dec ===
    #[test]
    fn refcount_inc_dec() {
        let rc = RefCount::new(1);
        assert_eq!(rc.inc(), 2);
        assert_eq!(rc.inc(), 3);
        assert_eq!(rc.dec(), 2);
        assert_eq!(rc.get(), 2);
    }

    // === 5. RefCount clones share the same underlying count ===
    #[test]
    fn refcount_clones_share_state() {
        let rc = RefCount::new(0);
        let rc2 = rc.clone();
        rc.inc();
        assert_eq!(rc2.get(), 1);
    }

    // === 6. WorkingThread acquire/release on the current thread ===
    #[test]
    fn working_thread_acquire_release() {
        let wt = WorkingThread::new();
        assert!(!wt.is_current());
        wt.acquire();
        assert!(wt.is_current());
        wt.release();
        assert!(!wt.is_current());
    }

    // === 7. WorkingThread is thread-specific ===
    #[test]
    fn working_thread_not_current_from_other_thread() {
        let wt = Arc::new({
            let w = WorkingThread::new();
            w.acquire();
            w
        });
        assert!(wt.is_current());
        let wt2 = Arc::clone(&wt);
        let handle = std::thread::spawn(move || wt2.is_current());
        assert!(!handle.join().unwrap());
    }
}
