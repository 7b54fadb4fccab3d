//! Per-agent subscription storage: which `(mbox, type, state)` triples map
//! to which handler, plus the deadletter and awaiting-deregistration
//! sentinels a live handler table needs.
//!
//! Grounded on the adaptive-container note `lumen-rt`'s own module list
//! carries for its service registry, and on the fixed/growable split
//! `limits.rs` already implements for the same "small known set vs. open
//! set" tradeoff — subscriptions are kept in a sorted `Vec` searched by key,
//! since an agent's subscription table is built once at definition time and
//! mutated only on the working thread afterward.

use std::any::TypeId;

use crate::ids::MailboxId;
use crate::message::Message;
use crate::state::StateId;

/// A handler callback: takes the message and produces nothing, running for
/// its side effects on the agent's own state.
pub type HandlerFn = Box<dyn FnMut(&mut Message) + Send>;

/// The key a subscription is stored and searched under.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct SubscriptionKey {
    pub mbox: MailboxId,
    pub type_id_bits: u64,
    pub state: StateId,
}

impl SubscriptionKey {
    pub fn new(mbox: MailboxId, type_id: TypeId, state: StateId) -> Self {
        Self {
            mbox,
            type_id_bits: type_id_hash(type_id),
            state,
        }
    }
}

// `TypeId` doesn't expose a stable integer, so we hash it once into a u64
// purely to get an `Ord` key cheap to sort and binary-search on; equality
// still goes through the original `TypeId` stored alongside each record,
// since a hash collision must never be treated as a type match.
fn type_id_hash(type_id: TypeId) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    type_id.hash(&mut hasher);
    hasher.finish()
}

enum Slot {
    Handler { type_id: TypeId, handler: HandlerFn },
    /// A "transfer to state" intermediate subscription (spec §4.6): when a
    /// matching message arrives, the agent switches to `target` and the
    /// handler-finder re-looks-up `(mbox, type)` there instead of invoking
    /// anything at this state.
    Intermediate { type_id: TypeId, target: StateId },
    Deadletter { type_id: TypeId },
    AwaitingDeregistration { type_id: TypeId },
}

/// What a subscription lookup found at a given `(mbox, type, state)` key.
pub enum Lookup<'a> {
    Final(&'a mut HandlerFn),
    Intermediate(StateId),
    Deadletter,
    AwaitingDeregistration,
}

struct Record {
    key: SubscriptionKey,
    slot: Slot,
}

/// One agent's subscription table.
#[derive(Default)]
pub struct SubscriptionStorage {
    records: Vec<Record>,
}

impl SubscriptionStorage {
    pub fn new() -> Self {
        Self { records: Vec::new() }
    }

    fn find_index(&self, key: SubscriptionKey, type_id: TypeId) -> Result<usize, usize> {
        match self.records.binary_search_by_key(&key, |r| r.key) {
            Ok(idx) => {
                // binary_search_by_key can return any match among equal keys;
                // walk back to the exact (key, type_id) pair since the hash
                // key alone doesn't disambiguate collisions.
                let mut i = idx;
                while i > 0 && self.records[i - 1].key == key {
                    i -= 1;
                }
                while i < self.records.len() && self.records[i].key == key {
                    if matching_type(&self.records[i].slot) == type_id {
                        return Ok(i);
                    }
                    i += 1;
                }
                Err(idx)
            }
            Err(idx) => Err(idx),
        }
    }

    /// Install a live handler for `(mbox, type, state)`. Replaces any
    /// existing entry for the same key.
    pub fn subscribe(
        &mut self,
        mbox: MailboxId,
        type_id: TypeId,
        state: StateId,
        handler: HandlerFn,
    ) {
        let key = SubscriptionKey::new(mbox, type_id, state);
        let record = Record {
            key,
            slot: Slot::Handler { type_id, handler },
        };
        match self.find_index(key, type_id) {
            Ok(idx) => self.records[idx] = record,
            Err(idx) => self.records.insert(idx, record),
        }
    }

    /// Install a transfer-to-state subscription for `(mbox, type, state)`:
    /// on match, the agent switches to `target` instead of running a
    /// handler at `state`.
    pub fn subscribe_intermediate(
        &mut self,
        mbox: MailboxId,
        type_id: TypeId,
        state: StateId,
        target: StateId,
    ) {
        let key = SubscriptionKey::new(mbox, type_id, state);
        let record = Record {
            key,
            slot: Slot::Intermediate { type_id, target },
        };
        match self.find_index(key, type_id) {
            Ok(idx) => self.records[idx] = record,
            Err(idx) => self.records.insert(idx, record),
        }
    }

    /// Look up whatever is installed at `(mbox, type, state)`, regardless
    /// of slot kind. Returns `None` if nothing is registered there at all.
    pub fn lookup(&mut self, mbox: MailboxId, type_id: TypeId, state: StateId) -> Option<Lookup<'_>> {
        let key = SubscriptionKey::new(mbox, type_id, state);
        let idx = self.find_index(key, type_id).ok()?;
        Some(match &mut self.records[idx].slot {
            Slot::Handler { handler, .. } => Lookup::Final(handler),
            Slot::Intermediate { target, .. } => Lookup::Intermediate(*target),
            Slot::Deadletter { .. } => Lookup::Deadletter,
            Slot::AwaitingDeregistration { .. } => Lookup::AwaitingDeregistration,
        })
    }

    /// Mark `(mbox, type, state)` as routed to the deadletter handler
    /// instead of removing it outright — used when a type is explicitly
    /// declared unhandled in a state rather than simply never subscribed.
    pub fn mark_deadletter(&mut self, mbox: MailboxId, type_id: TypeId, state: StateId) {
        let key = SubscriptionKey::new(mbox, type_id, state);
        let record = Record {
            key,
            slot: Slot::Deadletter { type_id },
        };
        match self.find_index(key, type_id) {
            Ok(idx) => self.records[idx] = record,
            Err(idx) => self.records.insert(idx, record),
        }
    }

    /// Mark `(mbox, type, state)` as awaiting deregistration: the agent has
    /// unsubscribed but the coop's multi-phase teardown sequence hasn't yet
    /// reached the point where it's safe to fully drop the entry.
    pub fn mark_awaiting_deregistration(&mut self, mbox: MailboxId, type_id: TypeId, state: StateId) {
        let key = SubscriptionKey::new(mbox, type_id, state);
        if let Ok(idx) = self.find_index(key, type_id) {
            self.records[idx].slot = Slot::AwaitingDeregistration { type_id };
        }
    }

    /// Remove a subscription outright.
    pub fn unsubscribe(&mut self, mbox: MailboxId, type_id: TypeId, state: StateId) {
        let key = SubscriptionKey::new(mbox, type_id, state);
        if let Ok(idx) = self.find_index(key, type_id) {
            self.records.remove(idx);
        }
    }

    /// Look up the handler for `(mbox, type, state)`, if a live (non-sentinel)
    /// one is installed.
    pub fn handler_mut(
        &mut self,
        mbox: MailboxId,
        type_id: TypeId,
        state: StateId,
    ) -> Option<&mut HandlerFn> {
        let key = SubscriptionKey::new(mbox, type_id, state);
        let idx = self.find_index(key, type_id).ok()?;
        match &mut self.records[idx].slot {
            Slot::Handler { handler, .. } => Some(handler),
            _ => None,
        }
    }

    /// `true` if `(mbox, type, state)` is explicitly routed to the
    /// deadletter handler.
    pub fn is_deadletter(&self, mbox: MailboxId, type_id: TypeId, state: StateId) -> bool {
        let key = SubscriptionKey::new(mbox, type_id, state);
        matches!(
            self.find_index(key, type_id).ok().map(|i| &self.records[i].slot),
            Some(Slot::Deadletter { .. })
        )
    }

    /// `true` if `(mbox, type, state)` is awaiting deregistration.
    pub fn is_awaiting_deregistration(&self, mbox: MailboxId, type_id: TypeId, state: StateId) -> bool {
        let key = SubscriptionKey::new(mbox, type_id, state);
        matches!(
            self.find_index(key, type_id).ok().map(|i| &self.records[i].slot),
            Some(Slot::AwaitingDeregistration { .. })
        )
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn matching_type(slot: &Slot) -> TypeId {
    match slot {
        Slot::Handler { type_id, .. } => *type_id,
        Slot::Intermediate { type_id, .. } => *type_id,
        Slot::Deadletter { type_id } => *type_id,
        Slot::AwaitingDeregistration { type_id } => *type_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tick;

    fn noop_handler() -> HandlerFn {
        Box::new(|_msg| {})
    }

    // === 1. subscribe then handler_mut finds the handler ===
    #[test]
    fn subscribe_and_lookup() {
        let mut storage = SubscriptionStorage::new();
        let mbox = MailboxId::next();
        let state = StateId::next();
        storage.subscribe(mbox, TypeId::of::<Tick>(), state, noop_handler());
        assert!(storage.handler_mut(mbox, TypeId::of::<Tick>(), state).is_some());
    }

    // === 2. unsubscribe removes the entry ===
    #[test]
    fn unsubscribe_removes_entry() {
        let mut storage = SubscriptionStorage::new();
        let mbox = MailboxId::next();
        let state = StateId::next();
        storage.subscribe(mbox, TypeId::of::<Tick>(), state, noop_handler());
        storage.unsubscribe(mbox, TypeId::of::<Tick>(), state);
        assert!(storage.handler_mut(mbox, TypeId::of::<Tick>(), state).is_none());
    }

    // === 3. different states for the same (mbox, type) are independent ===
    #[test]
    fn different_states_are_independent() {
        let mut storage = SubscriptionStorage::new();
        let mbox = MailboxId::next();
        let state_a = StateId::next();
        let state_b = StateId::next();
        storage.subscribe(mbox, TypeId::of::<Tick>(), state_a, noop_handler());
        assert!(storage.handler_mut(mbox, TypeId::of::<Tick>(), state_b).is_none());
    }

    // === 4. deadletter marking is observable and not a live handler ===
    #[test]
    fn deadletter_marking() {
        let mut storage = SubscriptionStorage::new();
        let mbox = MailboxId::next();
        let state = StateId::next();
        storage.mark_deadletter(mbox, TypeId::of::<Tick>(), state);
        assert!(storage.is_deadletter(mbox, TypeId::of::<Tick>(), state));
        assert!(storage.handler_mut(mbox, TypeId::of::<Tick>(), state).is_none());
    }

    // === 5. awaiting-deregistration sentinel replaces a live handler ===
    #[test]
    fn awaiting_deregistration_replaces_handler() {
        let mut storage = SubscriptionStorage::new();
        let mbox = MailboxId::next();
        let state = StateId::next();
        storage.subscribe(mbox, TypeId::of::<Tick>(), state, noop_handler());
        storage.mark_awaiting_deregistration(mbox, TypeId::of::<Tick>(), state);
        assert!(storage.is_awaiting_deregistration(mbox, TypeId::of::<Tick>(), state));
        assert!(storage.handler_mut(mbox, TypeId::of::<Tick>(), state).is_none());
    }

    // === 6. re-subscribing replaces the prior entry rather than duplicating ===
    #[test]
    fn resubscribe_replaces() {
        let mut storage = SubscriptionStorage::new();
        let mbox = MailboxId::next();
        let state = StateId::next();
        storage.subscribe(mbox, TypeId::of::<Tick>(), state, noop_handler());
        storage.subscribe(mbox, TypeId::of::<Tick>(), state, noop_handler());
        assert_eq!(storage.len(), 1);
    }

    // === 7. an intermediate (transfer-to-state) subscription is distinguishable from a final handler ===
    #[test]
    fn intermediate_subscription_is_distinguishable() {
        let mut storage = SubscriptionStorage::new();
        let mbox = MailboxId::next();
        let state = StateId::next();
        let target = StateId::next();
        storage.subscribe_intermediate(mbox, TypeId::of::<Tick>(), state, target);
        match storage.lookup(mbox, TypeId::of::<Tick>(), state) {
            Some(Lookup::Intermediate(t)) => assert_eq!(t, target),
            _ => panic!("expected Intermediate lookup"),
        }
        assert!(storage.handler_mut(mbox, TypeId::of::<Tick>(), state).is_none());
    }

    // === 8. lookup on an empty slot returns None ===
    #[test]
    fn lookup_empty_slot_is_none() {
        let mut storage = SubscriptionStorage::new();
        let mbox = MailboxId::next();
        let state = StateId::next();
        assert!(storage.lookup(mbox, TypeId::of::<Tick>(), state).is_none());
    }
}
