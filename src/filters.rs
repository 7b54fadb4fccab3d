//! Delivery-filter registry.
//!
//! A delivery filter is a predicate over a message, installed per
//! `(mbox, type)` pair on the *receiving* agent, evaluated before the
//! subscription lookup runs. Grounded on the filter-then-subscription
//! ordering in `local_mbox.hpp`, and on the closure-predicate storage idiom
//! `lumen-rt`'s `Mailbox::recv_selective` already uses for its own
//! predicate-based selective receive.

use std::any::TypeId;
use std::collections::HashMap;

use crate::ids::MailboxId;
use crate::message::Message;

type Predicate = Box<dyn Fn(&Message) -> bool + Send>;

/// One agent's delivery-filter table, keyed by `(subscriber, type)`.
///
/// `subscriber` identifies the receiving agent by its own direct mailbox id,
/// not the mailbox the filter is attached to: a named (MPMC) mailbox has one
/// `FilterRegistry` shared across all of its subscribers, and each
/// subscriber's filter must be independent of the others' — installing a
/// filter "for this agent" on a broadcast mailbox must not also restrict
/// delivery to every other subscriber of the same type.
#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<(MailboxId, TypeId), Predicate>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Install (or replace) the filter for `(subscriber, type)`. Only one
    /// filter may be active per pair at a time: the last call wins.
    pub fn set_filter<F>(&mut self, subscriber: MailboxId, type_id: TypeId, predicate: F)
    where
        F: Fn(&Message) -> bool + Send + 'static,
    {
        self.filters.insert((subscriber, type_id), Box::new(predicate));
    }

    /// Remove the filter for `(subscriber, type)`, if any.
    pub fn drop_filter(&mut self, subscriber: MailboxId, type_id: TypeId) {
        self.filters.remove(&(subscriber, type_id));
    }

    /// Evaluate the filter for this message's `(subscriber, type)`, if one
    /// is installed. Absence of a filter means "accept" — filters are
    /// opt-in restrictions, not a default-deny allowlist.
    pub fn accepts(&self, subscriber: MailboxId, msg: &Message) -> bool {
        match self.filters.get(&(subscriber, msg.type_id())) {
            Some(predicate) => predicate(msg),
            None => true,
        }
    }

    /// `true` if no filter is installed for this `(subscriber, type)` —
    /// used by the subscription-table compaction pass (Open Question 1) to
    /// decide whether a filter-only entry can be pruned.
    pub fn is_empty_for(&self, subscriber: MailboxId, type_id: TypeId) -> bool {
        !self.filters.contains_key(&(subscriber, type_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tick(u32);

    // === 1. absence of a filter accepts everything ===
    #[test]
    fn no_filter_accepts_all() {
        let registry = FilterRegistry::new();
        let mbox = MailboxId::next();
        let msg = Message::classical(Tick(1));
        assert!(registry.accepts(mbox, &msg));
    }

    // === 2. installed filter rejects messages that fail the predicate ===
    #[test]
    fn filter_rejects_failing_predicate() {
        let mut registry = FilterRegistry::new();
        let mbox = MailboxId::next();
        registry.set_filter(mbox, TypeId::of::<Tick>(), |m: &Message| {
            m.downcast_ref::<Tick>().map(|t| t.0 % 2 == 0).unwrap_or(false)
        });
        assert!(!registry.accepts(mbox, &Message::classical(Tick(1))));
        assert!(registry.accepts(mbox, &Message::classical(Tick(2))));
    }

    // === 3. filters are scoped per mbox ===
    #[test]
    fn filters_scoped_per_mbox() {
        let mut registry = FilterRegistry::new();
        let mbox_a = MailboxId::next();
        let mbox_b = MailboxId::next();
        registry.set_filter(mbox_a, TypeId::of::<Tick>(), |_| false);
        assert!(!registry.accepts(mbox_a, &Message::classical(Tick(1))));
        assert!(registry.accepts(mbox_b, &Message::classical(Tick(1))));
    }

    // === 4. replacing a filter drops the old predicate ===
    #[test]
    fn set_filter_replaces_existing() {
        let mut registry = FilterRegistry::new();
        let mbox = MailboxId::next();
        registry.set_filter(mbox, TypeId::of::<Tick>(), |_| false);
        registry.set_filter(mbox, TypeId::of::<Tick>(), |_| true);
        assert!(registry.accepts(mbox, &Message::classical(Tick(1))));
    }

    // === 5. drop_filter reverts to default-accept ===
    #[test]
    fn drop_filter_reverts_to_accept() {
        let mut registry = FilterRegistry::new();
        let mbox = MailboxId::next();
        registry.set_filter(mbox, TypeId::of::<Tick>(), |_| false);
        registry.drop_filter(mbox, TypeId::of::<Tick>());
        assert!(registry.accepts(mbox, &Message::classical(Tick(1))));
    }

    // === 6. is_empty_for reports filter presence for compaction ===
    #[test]
    fn is_empty_for_tracks_presence() {
        let mut registry = FilterRegistry::new();
        let mbox = MailboxId::next();
        assert!(registry.is_empty_for(mbox, TypeId::of::<Tick>()));
        registry.set_filter(mbox, TypeId::of::<Tick>(), |_| true);
        assert!(!registry.is_empty_for(mbox, TypeId::of::<Tick>()));
    }
}
