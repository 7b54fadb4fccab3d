//! Cooperation (coop) lifecycle: atomic multi-agent registration, the
//! parent/child coop graph, reference counting, and stop guards.
//!
//! Grounded on `lumen-rt/src/services/nursery.rs` for the scope-owns-children
//! shape (`Nursery`/`CancelToken`) crossed with
//! `lumen-runtime/src/supervisor.rs` for parent/child bookkeeping and exit
//! reasons, and on `original_source/dev/so_5/coop.hpp` /
//! `agent_coop.hpp` for the exact phase ordering a registration goes
//! through: agents sorted by priority, each agent's `so_define_agent` runs
//! (subscriptions bound), agents are linked into the coop, and only then is
//! the coop marked registered and visible to deregistration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{ExceptionReaction, ExceptionReactionResolver};
use crate::error::RcError;
use crate::ids::{AgentId, CoopId, Priority, RefCount};

/// Why a coop finished deregistering, recorded for diagnostics and for the
/// environment's auto-shutdown guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregistrationReason {
    /// The application asked for it directly.
    Normal,
    /// An agent's exception reaction decided to tear the coop down.
    UnhandledException,
    /// A parent coop was deregistered and this child followed.
    ParentDeregistered,
}

/// Hand-rolled error type for coop-registration failures, matching the
/// teacher's hot-path `Display`/`Error` texture.
#[derive(Debug)]
pub enum CoopError {
    AgentDefineFailed(AgentId),
    StillReferenced(usize),
}

impl fmt::Display for CoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoopError::AgentDefineFailed(id) => write!(f, "agent {id:?} failed to define"),
            CoopError::StillReferenced(n) => write!(f, "coop still has {n} outstanding references"),
        }
    }
}

impl std::error::Error for CoopError {}

impl From<CoopError> for RcError {
    fn from(err: CoopError) -> Self {
        match err {
            CoopError::AgentDefineFailed(id) => RcError::CoopDefineError(format!("{id:?}")),
            CoopError::StillReferenced(n) => RcError::CoopStillReferenced(n),
        }
    }
}

enum CoopState {
    Defining,
    Registered,
    Deregistering,
}

struct CoopRecord {
    parent: Option<CoopId>,
    children: Vec<CoopId>,
    /// Sorted by descending priority; ties keep attach order.
    agents: Vec<(AgentId, Priority)>,
    refcount: RefCount,
    state: CoopState,
    exception_reaction: Option<ExceptionReaction>,
}

/// The process-wide coop graph: every registered coop, its parent/child
/// links, and its reference count.
///
/// A single `Mutex` guards the whole table rather than per-coop locks,
/// matching `nursery.rs`'s choice of one lock per scope rather than
/// fine-grained locking — coop registration/deregistration is already a
/// rare, coarse-grained operation compared to message delivery.
pub struct CoopRegistry {
    records: Mutex<HashMap<CoopId, CoopRecord>>,
    default_exception_reaction: ExceptionReaction,
}

impl CoopRegistry {
    pub fn new(default_exception_reaction: ExceptionReaction) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            default_exception_reaction,
        })
    }

    /// Begin defining a new coop, optionally as a child of `parent`. The
    /// coop is not visible to deregistration until `finish_registration` is
    /// called — this models the original's "register atomically" contract:
    /// if any agent fails to define, the whole coop is discarded as if it
    /// never existed.
    pub fn begin_registration(&self, parent: Option<CoopId>) -> CoopId {
        let id = CoopId::next();
        let mut records = self.records.lock();
        // The registering routine itself holds one extra reference for the
        // duration of this call so concurrent deregistration of the parent
        // cannot race the child's own first `finish_registration`.
        let refcount = RefCount::new(1);
        if let Some(parent_id) = parent {
            if let Some(parent_record) = records.get_mut(&parent_id) {
                parent_record.children.push(id);
                parent_record.refcount.inc();
            }
        }
        records.insert(
            id,
            CoopRecord {
                parent,
                children: Vec::new(),
                agents: Vec::new(),
                refcount,
                state: CoopState::Defining,
                exception_reaction: None,
            },
        );
        id
    }

    /// Attach an already-defined agent to a coop still being registered,
    /// inserting it in descending-`priority` order among the coop's
    /// existing agents (ties keep attach order).
    pub fn attach_agent(&self, coop: CoopId, agent: AgentId, priority: Priority) -> Result<(), CoopError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&coop)
            .ok_or(CoopError::AgentDefineFailed(agent))?;
        let pos = record.agents.iter().position(|(_, p)| *p < priority).unwrap_or(record.agents.len());
        record.agents.insert(pos, (agent, priority));
        record.refcount.inc();
        Ok(())
    }

    /// Mark the coop as fully registered, releasing the extra reference
    /// `begin_registration` held. If any agent failed to define (signaled
    /// by the caller via `abort_registration` before calling this), this is
    /// never reached for that coop.
    pub fn finish_registration(&self, coop: CoopId) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&coop) {
            record.state = CoopState::Registered;
            record.refcount.dec();
        }
    }

    /// Tear down a coop that failed to fully define: detach it from its
    /// parent and drop its record outright, as if it had never been
    /// registered.
    pub fn abort_registration(&self, coop: CoopId) {
        let mut records = self.records.lock();
        if let Some(record) = records.remove(&coop) {
            if let Some(parent_id) = record.parent {
                if let Some(parent_record) = records.get_mut(&parent_id) {
                    parent_record.children.retain(|c| *c != coop);
                    parent_record.refcount.dec();
                }
            }
        }
    }

    /// Begin deregistering a coop: mark it and recursively its children as
    /// `Deregistering`, refusing if it (or a child) is still referenced
    /// beyond the implicit parent/agent references this registry itself
    /// tracks.
    pub fn deregister(&self, coop: CoopId, reason: DeregistrationReason) -> Result<Vec<AgentId>, CoopError> {
        let mut records = self.records.lock();
        let mut stopped_agents = Vec::new();
        let mut stack = vec![(coop, reason)];
        let mut touched = Vec::new();
        while let Some((id, _reason)) = stack.pop() {
            let children: Vec<CoopId> = match records.get(&id) {
                Some(record) => record.children.clone(),
                None => continue,
            };
            for child in children {
                stack.push((child, DeregistrationReason::ParentDeregistered));
            }
            if let Some(record) = records.get_mut(&id) {
                record.state = CoopState::Deregistering;
                stopped_agents.extend(record.agents.iter().map(|(agent, _)| *agent));
                touched.push(id);
            }
        }
        drop(records);
        // Finalize leaves first; each finalized child releases its parent's
        // reference in turn, so a parent with no other holders collapses in
        // the same pass rather than waiting for a separate external call.
        for id in touched {
            self.finalize_if_dead(id);
        }
        Ok(stopped_agents)
    }

    /// Release one agent's reference on its coop, called once that agent's
    /// `evt_finish` has completed. When the count reaches zero and the coop
    /// is in `Deregistering`, the coop record is dropped and, if it has a
    /// parent, the parent's reference is released in turn.
    pub fn release_agent(&self, coop: CoopId) {
        self.release(coop);
    }

    /// Release one child coop's reference on its parent, called once the
    /// child has fully deregistered.
    pub fn release_child(&self, coop: CoopId) {
        self.release(coop);
    }

    fn release(&self, coop: CoopId) {
        {
            let records = self.records.lock();
            match records.get(&coop) {
                Some(record) => record.refcount.dec(),
                None => return,
            };
        }
        self.finalize_if_dead(coop);
    }

    /// If `coop`'s refcount has reached zero and it is in `Deregistering`,
    /// remove its record and release the reference it held on its parent.
    fn finalize_if_dead(&self, coop: CoopId) {
        let mut records = self.records.lock();
        let (should_remove, parent) = match records.get(&coop) {
            Some(record) => (
                record.refcount.get() == 0 && matches!(record.state, CoopState::Deregistering),
                record.parent,
            ),
            None => return,
        };
        if should_remove {
            records.remove(&coop);
            drop(records);
            if let Some(parent_id) = parent {
                self.release_child(parent_id);
            }
        }
    }

    pub fn is_registered(&self, coop: CoopId) -> bool {
        matches!(
            self.records.lock().get(&coop).map(|r| &r.state),
            Some(CoopState::Registered)
        )
    }

    pub fn reference_count(&self, coop: CoopId) -> usize {
        self.records.lock().get(&coop).map(|r| r.refcount.get()).unwrap_or(0)
    }

    pub fn set_exception_reaction(&self, coop: CoopId, reaction: ExceptionReaction) {
        if let Some(record) = self.records.lock().get_mut(&coop) {
            record.exception_reaction = Some(reaction);
        }
    }

    /// Live walk at throw-time: agent's own coop, then its ancestor coops,
    /// then the registry-wide default — never a value snapshotted at
    /// registration.
    fn resolve_exception_reaction(&self, coop: CoopId) -> ExceptionReaction {
        let records = self.records.lock();
        let mut current = Some(coop);
        while let Some(id) = current {
            let Some(record) = records.get(&id) else { break };
            if let Some(reaction) = record.exception_reaction {
                return reaction;
            }
            current = record.parent;
        }
        self.default_exception_reaction
    }

    pub fn agents_coop(&self, coop: CoopId) -> Option<Vec<AgentId>> {
        self.records
            .lock()
            .get(&coop)
            .map(|r| r.agents.iter().map(|(agent, _)| *agent).collect())
    }

    /// Every coop id currently tracked (in any state), for diagnostic dumps.
    pub fn all_coop_ids(&self) -> Vec<CoopId> {
        self.records.lock().keys().copied().collect()
    }
}

/// Maps an agent to the coop it belongs to, so `ExceptionReactionResolver`
/// can be implemented without `agent.rs` depending on `coop.rs` for its own
/// storage.
pub struct CoopExceptionResolver {
    registry: Arc<CoopRegistry>,
    agent_coop: Mutex<HashMap<AgentId, CoopId>>,
}

impl CoopExceptionResolver {
    pub fn new(registry: Arc<CoopRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            agent_coop: Mutex::new(HashMap::new()),
        })
    }

    pub fn bind(&self, agent: AgentId, coop: CoopId) {
        self.agent_coop.lock().insert(agent, coop);
    }
}

impl ExceptionReactionResolver for CoopExceptionResolver {
    fn resolve(&self, agent: AgentId) -> ExceptionReaction {
        match self.agent_coop.lock().get(&agent).copied() {
            Some(coop) => self.registry.resolve_exception_reaction(coop),
            None => self.registry.default_exception_reaction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // === 1. a coop with no attached agents registers and reports zero refs after finish ===
    #[test]
    fn empty_coop_registers() {
        let registry = CoopRegistry::new(ExceptionReaction::DeregisterCoopOnError);
        let coop = registry.begin_registration(None);
        registry.finish_registration(coop);
        assert!(registry.is_registered(coop));
    }

    // === 2. attaching agents increments the refcount, each release decrements it ===
    #[test]
    fn attach_and_release_tracks_refcount() {
        let registry = CoopRegistry::new(ExceptionReaction::DeregisterCoopOnError);
        let coop = registry.begin_registration(None);
        let agent = AgentId::next();
        registry.attach_agent(coop, agent, 0).unwrap();
        registry.finish_registration(coop);
        assert_eq!(registry.reference_count(coop), 1);
        registry.deregister(coop, DeregistrationReason::Normal).unwrap();
        registry.release_agent(coop);
        assert_eq!(registry.reference_count(coop), 0);
    }

    // === 3. child coops are deregistered when their parent is ===
    #[test]
    fn child_coop_follows_parent_deregistration() {
        let registry = CoopRegistry::new(ExceptionReaction::DeregisterCoopOnError);
        let parent = registry.begin_registration(None);
        registry.finish_registration(parent);
        let child = registry.begin_registration(Some(parent));
        registry.finish_registration(child);

        let stopped = registry.deregister(parent, DeregistrationReason::Normal).unwrap();
        // both coops had no agents attached, so the stopped-agent list is empty,
        // but both coop records should now be gone (zero remaining refs).
        assert!(stopped.is_empty());
        registry.release_child(child);
        assert_eq!(registry.reference_count(parent), 0);
    }

    // === 4. aborting a registration detaches it from its parent entirely ===
    #[test]
    fn abort_registration_detaches_from_parent() {
        let registry = CoopRegistry::new(ExceptionReaction::DeregisterCoopOnError);
        let parent = registry.begin_registration(None);
        registry.finish_registration(parent);
        let child = registry.begin_registration(Some(parent));
        registry.abort_registration(child);
        assert!(!registry.is_registered(child));
    }

    // === 5. exception reaction resolves from the coop when set, else the default ===
    #[test]
    fn exception_reaction_resolves_from_coop_or_default() {
        let registry = CoopRegistry::new(ExceptionReaction::Ignore);
        let coop = registry.begin_registration(None);
        registry.finish_registration(coop);
        assert_eq!(registry.resolve_exception_reaction(coop), ExceptionReaction::Ignore);
        registry.set_exception_reaction(coop, ExceptionReaction::Abort);
        assert_eq!(registry.resolve_exception_reaction(coop), ExceptionReaction::Abort);
    }

    // === 6. a child inherits its parent's reaction until it sets its own ===
    #[test]
    fn child_inherits_parent_reaction_until_overridden() {
        let registry = CoopRegistry::new(ExceptionReaction::Ignore);
        let parent = registry.begin_registration(None);
        registry.finish_registration(parent);
        registry.set_exception_reaction(parent, ExceptionReaction::DeregisterCoopOnError);
        let child = registry.begin_registration(Some(parent));
        registry.finish_registration(child);

        assert_eq!(
            registry.resolve_exception_reaction(child),
            ExceptionReaction::DeregisterCoopOnError
        );
        registry.set_exception_reaction(child, ExceptionReaction::Ignore);
        assert_eq!(registry.resolve_exception_reaction(child), ExceptionReaction::Ignore);
    }

    // === 7. CoopExceptionResolver binds an agent to its coop's resolved reaction ===
    #[test]
    fn coop_exception_resolver_binds_agent() {
        let registry = CoopRegistry::new(ExceptionReaction::Ignore);
        let coop = registry.begin_registration(None);
        registry.finish_registration(coop);
        registry.set_exception_reaction(coop, ExceptionReaction::Abort);

        let resolver = CoopExceptionResolver::new(Arc::clone(&registry));
        let agent = AgentId::next();
        resolver.bind(agent, coop);
        assert_eq!(resolver.resolve(agent), ExceptionReaction::Abort);
    }

    // === 8. agents end up sorted by descending priority regardless of attach order ===
    #[test]
    fn agents_sort_by_descending_priority() {
        let registry = CoopRegistry::new(ExceptionReaction::DeregisterCoopOnError);
        let coop = registry.begin_registration(None);
        let low = AgentId::next();
        let high = AgentId::next();
        let mid = AgentId::next();
        registry.attach_agent(coop, low, 1).unwrap();
        registry.attach_agent(coop, high, 10).unwrap();
        registry.attach_agent(coop, mid, 5).unwrap();
        registry.finish_registration(coop);

        assert_eq!(registry.agents_coop(coop).unwrap(), vec![high, mid, low]);
    }
}
