//! Per-agent, per-message-type delivery limits.
//!
//! Grounded directly on `message_limit_internals.hpp`'s
//! `try_to_deliver_to_consumer`: the counter is incremented *before* the
//! over-limit comparison, and rolled back by one if the post-increment value
//! exceeds the configured limit. The worker thread undoes the matching
//! increment with exactly one decrement when it pops the demand, through a
//! `Drop`-based guard so a panicking handler or an early return still leaves
//! the counter correct — the same role `decrement_on_exception_t` plays in
//! the original.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::RcError;
use crate::message::{Message, MessageKind};

/// What to do when a message of a limited type arrives and the limit has
/// already been reached.
#[derive(Clone)]
pub enum OverflowAction {
    /// Abort the process: the caller configured a hard limit they never
    /// expect to hit in practice.
    Abort,
    /// Return `RcError::MsgLimitExceededThrow` to the sender.
    Throw,
    /// Silently discard the newest (just-arrived) message.
    DropNewest,
    /// Discard the oldest queued message of this type to make room, then
    /// enqueue the new one. Requires mbox cooperation; recorded here as the
    /// configured intent, applied by the mailbox on delivery.
    RemoveOldest,
    /// Replace the message with the result of calling `f` on the overflowing
    /// message, then redeliver the transformed message through the same
    /// limit check (bounded by `max_recursion_depth`).
    Transform(Arc<dyn Fn(&Message) -> TransformOutcome + Send + Sync>),
    /// Log the drop via the `delivery_trace` tracing target and discard.
    LogAndDrop,
}

/// What a `Transform` overflow action produced.
pub enum TransformOutcome {
    /// Replace with a new message of the same or a different type.
    Replaced(crate::message::Message),
    /// Give up and drop after all, same as `DropNewest`.
    GiveUp,
}

/// Per-type limit configuration: a capacity and the action to take on
/// overflow.
#[derive(Clone)]
pub struct LimitConfig {
    pub capacity: usize,
    pub action: OverflowAction,
}

/// A `Drop`-based guard around one successful increment. The increment
/// happens when a message is pushed into a mbox; the matching decrement
/// happens unconditionally when the guard drops, which is whenever the
/// message is popped back out for dispatch — whether the handler runs to
/// completion, panics, or the pipeline abandons it early. There is no way
/// to make the increment outlive the guard: a counter that stays bumped
/// forever after a message leaves the queue is exactly the bug this type
/// exists to rule out.
pub struct CounterGuard {
    counter: Arc<AtomicUsize>,
}

impl CounterGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        Self { counter }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The outcome of checking a message against its type's limit.
pub enum LimitCheck {
    /// Within limit; `guard` must be held alongside the message until it is
    /// popped back out of its mbox, at which point dropping the guard
    /// performs the matching decrement.
    Within(CounterGuard),
    /// Over limit; carries the configured action to apply.
    Overflow(OverflowAction),
    /// No limit configured for this type — unconditionally within limit.
    Unlimited,
}

struct LimitEntry {
    config: LimitConfig,
    counter: Arc<AtomicUsize>,
}

impl Clone for LimitEntry {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Storage backing one agent's limit table.
///
/// Mirrors `fixed_info_storage_t` / `growable_info_storage_t`: when no
/// default entry exists the table never grows past the types explicitly
/// registered ("fixed", backed by a sorted `Vec` searched by `TypeId`);
/// once a default entry for `any_unspecified_message` is installed, storage
/// switches to a `HashMap` that lazily clones the default for any
/// newly-seen type on first use ("growable").
enum Storage {
    Fixed(Vec<(TypeId, LimitEntry)>),
    Growable {
        entries: HashMap<TypeId, LimitEntry>,
        default: LimitEntry,
    },
}

/// The recursion-depth-bounded message-limit table for a single agent.
pub struct LimitRegistry {
    storage: Storage,
    max_recursion_depth: u32,
}

impl LimitRegistry {
    /// A fixed registry with only explicit per-type entries.
    pub fn fixed(max_recursion_depth: u32) -> Self {
        Self {
            storage: Storage::Fixed(Vec::new()),
            max_recursion_depth,
        }
    }

    /// A growable registry seeded with a default entry applied to any
    /// type not explicitly registered.
    pub fn growable(default: LimitConfig, max_recursion_depth: u32) -> Self {
        Self {
            storage: Storage::Growable {
                entries: HashMap::new(),
                default: LimitEntry {
                    config: default,
                    counter: Arc::new(AtomicUsize::new(0)),
                },
            },
            max_recursion_depth,
        }
    }

    /// Register an explicit per-type limit.
    pub fn set_limit(&mut self, type_id: TypeId, config: LimitConfig) {
        let entry = LimitEntry {
            config,
            counter: Arc::new(AtomicUsize::new(0)),
        };
        match &mut self.storage {
            Storage::Fixed(v) => match v.binary_search_by_key(&type_id, |(t, _)| *t) {
                Ok(idx) => v[idx].1 = entry,
                Err(idx) => v.insert(idx, (type_id, entry)),
            },
            Storage::Growable { entries, .. } => {
                entries.insert(type_id, entry);
            }
        }
    }

    fn lookup(&mut self, type_id: TypeId) -> Option<&LimitEntry> {
        match &mut self.storage {
            Storage::Fixed(v) => v
                .binary_search_by_key(&type_id, |(t, _)| *t)
                .ok()
                .map(|idx| &v[idx].1),
            Storage::Growable { entries, default } => {
                if !entries.contains_key(&type_id) {
                    entries.insert(type_id, default.clone());
                }
                entries.get(&type_id)
            }
        }
    }

    /// Check a just-arrived message against its type's configured limit.
    /// Service-request envelopes never hit `Transform`: the caller is
    /// expected to check `kind == MessageKind::ServiceRequest` before
    /// selecting `Transform`, but we defend here too since the transform
    /// closure itself has no visibility into the kind without `msg`.
    pub fn check(&mut self, msg: &Message) -> LimitCheck {
        let type_id = msg.type_id();
        let kind = msg.kind();
        let Some(entry) = self.lookup(type_id) else {
            return LimitCheck::Unlimited;
        };
        let counter = Arc::clone(&entry.counter);
        let new_value = counter.fetch_add(1, Ordering::AcqRel) + 1;
        if new_value <= entry.config.capacity {
            return LimitCheck::Within(CounterGuard::new(counter));
        }
        // Over limit: roll back the speculative increment.
        counter.fetch_sub(1, Ordering::AcqRel);
        let action = entry.config.action.clone();
        if matches!(kind, MessageKind::ServiceRequest) && matches!(action, OverflowAction::Transform(_)) {
            return LimitCheck::Overflow(OverflowAction::Throw);
        }
        LimitCheck::Overflow(action)
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }
}

/// What happened when a just-arrived message was pushed against a message
/// limit.
pub enum PushOutcome {
    /// Deliver `message` into the mbox. `guard`, if present, must be stored
    /// alongside it and dropped at pop time — that drop is the only place
    /// the counter is ever decremented.
    Deliver {
        message: Message,
        guard: Option<CounterGuard>,
    },
    /// The overflow action consumed the message (dropped, logged, or
    /// transformed into a replacement that itself did not survive); nothing
    /// further should happen at push time.
    Dropped,
}

/// Check `msg` against `registry`'s limit for its type and apply the
/// configured overflow action immediately if it is over limit, recursing
/// through `Transform` up to `max_recursion_depth`. This is the push-time
/// half of the increment/decrement pair `CounterGuard` implements — call
/// this from the mbox delivery path (`direct.rs::send`, `named.rs::deliver`),
/// never from the pop side.
pub fn check_and_apply(registry: &mut LimitRegistry, msg: Message, depth: u32) -> Result<PushOutcome, RcError> {
    if depth > registry.max_recursion_depth() {
        return Err(RcError::TransformRecursionDepthExceeded);
    }
    match registry.check(&msg) {
        LimitCheck::Unlimited => Ok(PushOutcome::Deliver { message: msg, guard: None }),
        LimitCheck::Within(guard) => Ok(PushOutcome::Deliver { message: msg, guard: Some(guard) }),
        LimitCheck::Overflow(action) => apply_overflow_action(registry, msg, action, depth),
    }
}

fn apply_overflow_action(
    registry: &mut LimitRegistry,
    msg: Message,
    action: OverflowAction,
    depth: u32,
) -> Result<PushOutcome, RcError> {
    match action {
        OverflowAction::Abort => std::process::abort(),
        OverflowAction::Throw => Err(RcError::MsgLimitExceededThrow),
        OverflowAction::DropNewest | OverflowAction::RemoveOldest => Ok(PushOutcome::Dropped),
        OverflowAction::LogAndDrop => {
            tracing::info!(target: "delivery_trace", type_name = msg.type_name(), "message dropped on overlimit");
            Ok(PushOutcome::Dropped)
        }
        OverflowAction::Transform(f) => match f(&msg) {
            TransformOutcome::Replaced(replacement) => check_and_apply(registry, replacement, depth + 1),
            TransformOutcome::GiveUp => Ok(PushOutcome::Dropped),
        },
    }
}
