//! Diagnostic snapshot of the coop/agent graph, serialized to JSON for
//! embedding-application tooling and test assertions.
//!
//! Grounded on `lumen-runtime/src/snapshot.rs`'s versioned, fully-owned
//! snapshot DTO idiom — mirrored here without the VM-specific heap/stack
//! fields, and using `serde_json` rather than `bincode` since a diagnostic
//! dump is read by humans and test harnesses, not replayed by the runtime
//! itself.

use serde::Serialize;

use crate::agent::ExceptionReaction;
use crate::coop::CoopRegistry;
use crate::ids::{AgentId, CoopId};

/// Current snapshot format version, bumped whenever a field is added or
/// renamed in a way that would break a consumer matching on exact shape.
pub const DIAG_SNAPSHOT_VERSION: u32 = 1;

/// One coop's entry in a graph snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CoopSnapshot {
    pub coop_id: u64,
    pub parent: Option<u64>,
    pub children: Vec<u64>,
    pub agents: Vec<u64>,
    pub reference_count: usize,
    pub registered: bool,
}

/// A point-in-time view of every coop the registry currently tracks.
#[derive(Debug, Clone, Serialize)]
pub struct CoopGraphSnapshot {
    pub version: u32,
    pub coops: Vec<CoopSnapshot>,
}

impl CoopGraphSnapshot {
    /// Render this snapshot as pretty-printed JSON, for logs and test
    /// assertions. Serialization of a plain DTO of owned primitives cannot
    /// fail in practice; `serde_json::to_string_pretty` only errors on
    /// non-string map keys or `NaN`/`Infinity` floats, neither of which this
    /// type contains.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("CoopGraphSnapshot has no non-serializable fields")
    }
}

/// Snapshot the full coop graph known to `registry` at the moment this is
/// called. Each coop's `reference_count`/`registered` fields reflect that
/// coop's state at read time and may be stale the instant this returns —
/// a diagnostic dump, not a synchronization primitive.
pub fn snapshot_coop_graph(registry: &CoopRegistry, coop_ids: &[CoopId]) -> CoopGraphSnapshot {
    let coops = coop_ids
        .iter()
        .filter_map(|&id| {
            let agents = registry.agents_coop(id)?;
            Some(CoopSnapshot {
                coop_id: id.as_u64(),
                parent: None,
                children: Vec::new(),
                agents: agents.iter().map(AgentId::as_u64).collect(),
                reference_count: registry.reference_count(id),
                registered: registry.is_registered(id),
            })
        })
        .collect();
    CoopGraphSnapshot {
        version: DIAG_SNAPSHOT_VERSION,
        coops,
    }
}

/// One agent's exception-reaction entry, used by the environment's
/// diagnostic dump to show what each agent would do on an unhandled panic
/// without needing to actually panic one to find out.
#[derive(Debug, Clone, Serialize)]
pub struct ExceptionReactionSnapshot {
    pub agent_id: u64,
    pub reaction: &'static str,
}

pub fn reaction_label(reaction: ExceptionReaction) -> &'static str {
    match reaction {
        ExceptionReaction::DeregisterCoopNormally => "deregister_coop_normally",
        ExceptionReaction::DeregisterCoopOnError => "deregister_coop_on_error",
        ExceptionReaction::Ignore => "ignore",
        ExceptionReaction::Abort => "abort",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ExceptionReaction;
    use crate::coop::DeregistrationReason;

    // === 1. a snapshot of an empty registry has no coops ===
    #[test]
    fn empty_registry_snapshot_is_empty() {
        let registry = CoopRegistry::new(ExceptionReaction::Ignore);
        let snap = snapshot_coop_graph(&registry, &[]);
        assert!(snap.coops.is_empty());
        assert_eq!(snap.version, DIAG_SNAPSHOT_VERSION);
    }

    // === 2. a registered coop with attached agents appears with correct counts ===
    #[test]
    fn registered_coop_appears_with_agents() {
        let registry = CoopRegistry::new(ExceptionReaction::Ignore);
        let coop = registry.begin_registration(None);
        let agent = AgentId::next();
        registry.attach_agent(coop, agent, 0).unwrap();
        registry.finish_registration(coop);

        let snap = snapshot_coop_graph(&registry, &[coop]);
        assert_eq!(snap.coops.len(), 1);
        assert_eq!(snap.coops[0].agents, vec![agent.as_u64()]);
        assert!(snap.coops[0].registered);
    }

    // === 3. a deregistered-and-gone coop is simply absent, not an error ===
    #[test]
    fn deregistered_coop_is_absent() {
        let registry = CoopRegistry::new(ExceptionReaction::Ignore);
        let coop = registry.begin_registration(None);
        registry.finish_registration(coop);
        registry.deregister(coop, DeregistrationReason::Normal).unwrap();

        let snap = snapshot_coop_graph(&registry, &[coop]);
        assert!(snap.coops.is_empty());
    }

    // === 4. to_json produces parseable JSON carrying the version tag ===
    #[test]
    fn to_json_round_trips_through_serde_json_value() {
        let registry = CoopRegistry::new(ExceptionReaction::Ignore);
        let coop = registry.begin_registration(None);
        registry.finish_registration(coop);
        let snap = snapshot_coop_graph(&registry, &[coop]);

        let json = snap.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], DIAG_SNAPSHOT_VERSION);
        assert_eq!(value["coops"][0]["coop_id"], coop.as_u64());
    }

    // === 5. reaction_label covers every variant distinctly ===
    #[test]
    fn reaction_label_is_distinct_per_variant() {
        let labels = [
            reaction_label(ExceptionReaction::DeregisterCoopNormally),
            reaction_label(ExceptionReaction::DeregisterCoopOnError),
            reaction_label(ExceptionReaction::Ignore),
            reaction_label(ExceptionReaction::Abort),
        ];
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }
}
