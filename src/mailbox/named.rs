//! The named (MPMC) mailbox: a routing point addressed by name rather than
//! by a single owning agent, fanning each message out to every current
//! subscriber for that message's type.
//!
//! Grounded on `lumen-runtime/src/channel.rs`'s fan-out broadcast idiom,
//! generalized to per-type subscriber lists the way `local_mbox.hpp`
//! structures its own subscriber table: filter check, then per-subscriber
//! push. Subscriber order within a type is kept sorted by descending
//! priority, matching `agent_coop.hpp`'s agent-ordering contract carried
//! over to fan-out delivery order.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::filters::FilterRegistry;
use crate::ids::{MailboxId, Priority};
use crate::mailbox::direct::{DirectSendError, DirectSender};
use crate::message::{Message, Mutability};

/// A mutable message was sent to a named (MPMC) mailbox. Mutable messages
/// may be edited in place by a handler before redelivery — a contract that
/// only makes sense for a single receiver, so fan-out delivery rejects them
/// outright rather than handing each subscriber a mutation of a message
/// some other subscriber may also be mutating.
#[derive(Debug)]
pub struct MutableViaMpmcError;

impl fmt::Display for MutableViaMpmcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutable message cannot be delivered via an MPMC mailbox")
    }
}

impl std::error::Error for MutableViaMpmcError {}

/// A shared, clone-on-deliver payload. Named mboxes fan a single logical
/// message out to N subscribers; since `Message`'s payload is `Box<dyn Any>`
/// and not generally `Clone`, the registered `clone_fn` is supplied by the
/// sender: messages delivered through a named mbox must be clonable at
/// the type the sender declares.
pub type CloneFn = std::sync::Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// Called once per successful delivery to a subscriber, after the message
/// lands in its direct mbox, so the subscriber's dispatcher can be woken
/// (a `Demand` event pushed) without `named.rs` depending on the event
/// queue or dispatcher directly.
pub type WakeFn = std::sync::Arc<dyn Fn() + Send + Sync>;

struct Subscriber {
    target: DirectSender,
    priority: Priority,
    clone_fn: CloneFn,
    wake: WakeFn,
}

/// A single named mbox's subscriber table, keyed by message type.
#[derive(Default)]
struct SubscriberTable {
    by_type: HashMap<TypeId, Vec<Subscriber>>,
}

/// A named (MPMC) mailbox.
pub struct NamedMailbox {
    id: MailboxId,
    subscribers: RwLock<SubscriberTable>,
    filters: RwLock<FilterRegistry>,
}

impl NamedMailbox {
    pub fn new() -> Self {
        Self {
            id: MailboxId::next(),
            subscribers: RwLock::new(SubscriberTable::default()),
            filters: RwLock::new(FilterRegistry::new()),
        }
    }

    pub fn id(&self) -> MailboxId {
        self.id
    }

    /// Subscribe `target` to messages of type `type_id`, using `clone_fn` to
    /// produce each subscriber's own copy from the original, and `wake` to
    /// notify the subscriber's dispatcher after each successful delivery.
    /// Inserted in descending-`priority` order among this type's existing
    /// subscribers, ties broken by arrival order.
    pub fn subscribe(&self, type_id: TypeId, target: DirectSender, priority: Priority, clone_fn: CloneFn, wake: WakeFn) {
        let mut table = self.subscribers.write();
        let list = table.by_type.entry(type_id).or_default();
        let pos = list.iter().position(|s| s.priority < priority).unwrap_or(list.len());
        list.insert(pos, Subscriber { target, priority, clone_fn, wake });
    }

    /// Remove every subscription `target` holds for `type_id`.
    pub fn unsubscribe(&self, type_id: TypeId, target_id: MailboxId) {
        if let Some(list) = self.subscribers.write().by_type.get_mut(&type_id) {
            list.retain(|s| s.target.id() != target_id);
        }
    }

    /// Install a delivery filter for `type_id` messages, scoped to the
    /// subscriber identified by `subscriber` (that subscriber's own direct
    /// mbox id). Only that subscriber's deliveries are filtered — every
    /// other subscriber of the same type keeps receiving unfiltered.
    pub fn set_filter<F>(&self, subscriber: MailboxId, type_id: TypeId, predicate: F)
    where
        F: Fn(&Message) -> bool + Send + 'static,
    {
        self.filters.write().set_filter(subscriber, type_id, predicate);
    }

    /// Remove `subscriber`'s filter for `type_id`, if any.
    pub fn drop_filter(&self, subscriber: MailboxId, type_id: TypeId) {
        self.filters.write().drop_filter(subscriber, type_id);
    }

    /// Deliver `msg` to every current subscriber for its type, in descending
    /// priority order, applying each subscriber's own filter independently.
    /// Returns the number of subscribers the message was actually pushed to;
    /// subscribers whose direct mbox has been dropped are skipped (and
    /// pruned) rather than causing the whole delivery to fail — fan-out
    /// delivery is best-effort. Rejects mutable messages outright: a
    /// fan-out mailbox has no single owner to hand a mutable reference to.
    pub fn deliver(&self, msg: Message) -> Result<usize, MutableViaMpmcError> {
        if msg.mutability() == Mutability::Mutable {
            return Err(MutableViaMpmcError);
        }
        let type_id = msg.type_id();
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let table = self.subscribers.read();
            let filters = self.filters.read();
            if let Some(list) = table.by_type.get(&type_id) {
                for (idx, sub) in list.iter().enumerate() {
                    // A filter that cannot even inspect the message (an
                    // envelope refusing to expose its payload) is treated
                    // the same as a filter that rejects it.
                    let accepted = msg
                        .inspect(|inner| filters.accepts(sub.target.id(), inner))
                        .unwrap_or(false);
                    if !accepted {
                        continue;
                    }
                    let copy = (sub.clone_fn)(&msg);
                    match sub.target.send(copy) {
                        Ok(()) => {
                            delivered += 1;
                            (sub.wake)();
                        }
                        Err(DirectSendError::Disconnected(_)) => dead.push(idx),
                        Err(DirectSendError::LimitExceeded(_)) => {
                            tracing::info!(
                                target: "delivery_trace",
                                subscriber = ?sub.target.id(),
                                "subscriber message limit exceeded, skipping this delivery"
                            );
                        }
                    }
                }
            }
        }
        if !dead.is_empty() {
            if let Some(list) = self.subscribers.write().by_type.get_mut(&type_id) {
                for idx in dead.into_iter().rev() {
                    list.remove(idx);
                }
            }
        }
        Ok(delivered)
    }

    pub fn subscriber_count(&self, type_id: TypeId) -> usize {
        self.subscribers
            .read()
            .by_type
            .get(&type_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for NamedMailbox {
    fn default() -> Self {
        Self::new()
    }
}
