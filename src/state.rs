//! The hierarchical state machine each agent owns privately.
//!
//! No module elsewhere in this codebase implements a composite state tree,
//! so this is grounded directly on `original_source/dev/so_5/rt/h/state.hpp`:
//! nesting bounded at 16 levels, shallow/deep history, enter/exit hooks,
//! per-state time limits that redirect to another state on expiry,
//! transfer-on-enter redirection, and suppression of a message type's
//! upward handler search past a given ancestor. Written in the
//! `Debug`/builder idiom `lumen-rt`'s other state-carrying service types
//! use, rather than translated from the C++ shape it was grounded on.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::RcError;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique id for one node in an agent's state tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(u64);

impl StateId {
    pub fn next() -> Self {
        Self(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateId({})", self.0)
    }
}

/// The maximum nesting depth from the root state to any descendant,
/// matching the original's hard-coded bound.
pub const MAX_STATE_NESTING_DEPTH: u8 = 16;

/// Whether re-entering a composite state resumes its last active child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMode {
    /// Always enter the state's designated initial child (or the state
    /// itself, if it has none).
    None,
    /// Resume the last active *direct* child only; that child's own
    /// sub-state resets to its initial child.
    Shallow,
    /// Resume the full chain of last-active descendants, recursively.
    Deep,
}

type Hook = Box<dyn Fn() + Send>;

struct StateNode {
    parent: Option<StateId>,
    children: HashSet<StateId>,
    history_mode: HistoryMode,
    initial_child: Option<StateId>,
    last_active_child: Option<StateId>,
    enter_hooks: Vec<Hook>,
    exit_hooks: Vec<Hook>,
    time_limit: Option<(Duration, StateId)>,
    transfer_to: Option<StateId>,
    suppressed: HashSet<TypeId>,
}

impl StateNode {
    fn new(parent: Option<StateId>) -> Self {
        Self {
            parent,
            children: HashSet::new(),
            history_mode: HistoryMode::None,
            initial_child: None,
            last_active_child: None,
            enter_hooks: Vec::new(),
            exit_hooks: Vec::new(),
            time_limit: None,
            transfer_to: None,
            suppressed: HashSet::new(),
        }
    }
}

/// The full composite-state tree for one agent, plus the currently active
/// leaf state.
///
/// `switching` guards against a `transfer_to_state` call re-entering itself
/// (e.g. an enter/exit hook that, through a shared handle back to this
/// agent, triggers another state switch before the first has finished
/// updating `active`) — the second call fails fast with
/// `rc_another_state_switch_in_progress` rather than corrupting history
/// pointers mid-walk.
pub struct StateMachine {
    states: HashMap<StateId, StateNode>,
    root: StateId,
    active: StateId,
    switching: AtomicBool,
}

impl StateMachine {
    /// Build a fresh machine with a single root state, active by default.
    pub fn new() -> Self {
        let root = StateId::next();
        let mut states = HashMap::new();
        states.insert(root, StateNode::new(None));
        Self {
            states,
            root,
            active: root,
            switching: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> StateId {
        self.root
    }

    pub fn active(&self) -> StateId {
        self.active
    }

    fn depth_of(&self, mut state: StateId) -> u8 {
        let mut depth = 1;
        while let Some(parent) = self.states.get(&state).and_then(|n| n.parent) {
            depth += 1;
            state = parent;
        }
        depth
    }

    /// Create a new child state under `parent`. `parent` must already exist
    /// in this tree.
    pub fn new_state(&mut self, parent: StateId) -> Result<StateId, RcError> {
        if !self.states.contains_key(&parent) {
            return Err(RcError::StateIsNotAnAgentState);
        }
        let depth = self.depth_of(parent) + 1;
        if depth > MAX_STATE_NESTING_DEPTH {
            return Err(RcError::MaxSubscriptionDepthExceeded(MAX_STATE_NESTING_DEPTH));
        }
        let id = StateId::next();
        self.states.insert(id, StateNode::new(Some(parent)));
        self.states.get_mut(&parent).unwrap().children.insert(id);
        Ok(id)
    }

    fn node(&self, state: StateId) -> Result<&StateNode, RcError> {
        self.states.get(&state).ok_or(RcError::StateIsNotAnAgentState)
    }

    fn node_mut(&mut self, state: StateId) -> Result<&mut StateNode, RcError> {
        self.states.get_mut(&state).ok_or(RcError::StateIsNotAnAgentState)
    }

    pub fn set_history(&mut self, state: StateId, mode: HistoryMode) -> Result<(), RcError> {
        self.node_mut(state)?.history_mode = mode;
        Ok(())
    }

    /// Declare `child` as `state`'s initial substate. Rejects a second call
    /// for the same state — the original substate must be cleared (there is
    /// no clear method; redefining a composite state's entry point is a
    /// configuration error, not a runtime operation).
    pub fn set_initial_child(&mut self, state: StateId, child: StateId) -> Result<(), RcError> {
        let node = self.node_mut(state)?;
        if node.initial_child.is_some() {
            return Err(RcError::InitialSubstateAlreadyDefined);
        }
        node.initial_child = Some(child);
        Ok(())
    }

    pub fn on_enter<F: Fn() + Send + 'static>(&mut self, state: StateId, hook: F) -> Result<(), RcError> {
        self.node_mut(state)?.enter_hooks.push(Box::new(hook));
        Ok(())
    }

    pub fn on_exit<F: Fn() + Send + 'static>(&mut self, state: StateId, hook: F) -> Result<(), RcError> {
        self.node_mut(state)?.exit_hooks.push(Box::new(hook));
        Ok(())
    }

    /// Install (or replace) this state's time limit: if the state is still
    /// active when `duration` elapses, the agent transfers to `target`.
    /// Replacing a limit builds the new one before dropping the old record,
    /// so an observer reading `time_limit()` between calls never sees a gap
    /// (spec supplemental feature, §3).
    pub fn set_time_limit(&mut self, state: StateId, duration: Duration, target: StateId) -> Result<(), RcError> {
        let node = self.node_mut(state)?;
        let new_limit = Some((duration, target));
        node.time_limit = new_limit;
        Ok(())
    }

    pub fn clear_time_limit(&mut self, state: StateId) -> Result<(), RcError> {
        self.node_mut(state)?.time_limit = None;
        Ok(())
    }

    pub fn time_limit(&self, state: StateId) -> Result<Option<(Duration, StateId)>, RcError> {
        Ok(self.node(state)?.time_limit)
    }

    /// Make entering `state` immediately redirect to `target` instead.
    pub fn set_transfer(&mut self, state: StateId, target: StateId) -> Result<(), RcError> {
        self.node_mut(state)?.transfer_to = Some(target);
        Ok(())
    }

    pub fn clear_transfer(&mut self, state: StateId) -> Result<(), RcError> {
        self.node_mut(state)?.transfer_to = None;
        Ok(())
    }

    /// Suppress upward handler search for `type_id` starting at `state`: a
    /// handler-finder walking this state's ancestor chain looking for a
    /// handler of `type_id` must stop at `state` without considering
    /// anything above it.
    pub fn suppress(&mut self, state: StateId, type_id: TypeId) -> Result<(), RcError> {
        self.node_mut(state)?.suppressed.insert(type_id);
        Ok(())
    }

    pub fn unsuppress(&mut self, state: StateId, type_id: TypeId) -> Result<(), RcError> {
        self.node_mut(state)?.suppressed.remove(&type_id);
        Ok(())
    }

    /// The ancestor search path for handler lookup, starting at `state` and
    /// walking up to (and including) the root, stopping early if any node
    /// along the way suppresses `type_id`, in which case the path ends at
    /// (and includes) that suppressing node.
    pub fn handler_search_path(&self, state: StateId, type_id: TypeId) -> Vec<StateId> {
        let mut path = Vec::new();
        let mut current = Some(state);
        while let Some(id) = current {
            path.push(id);
            let Some(node) = self.states.get(&id) else { break };
            if node.suppressed.contains(&type_id) {
                break;
            }
            current = node.parent;
        }
        path
    }

    /// Resolve transfer redirection chains for `target`, bounded to avoid an
    /// infinite loop between mutually-redirecting states.
    fn resolve_transfers(&self, mut target: StateId) -> Result<StateId, RcError> {
        for _ in 0..MAX_STATE_NESTING_DEPTH {
            match self.node(target)?.transfer_to {
                Some(next) => target = next,
                None => return Ok(target),
            }
        }
        Err(RcError::StateIsNotAnAgentState)
    }

    /// Resolve a composite state's entry point given its history mode,
    /// recursing through initial children / last-active history as deep as
    /// the tree goes, landing on a leaf (a state with no children).
    ///
    /// A composite state (one with children) that has neither a recorded
    /// history entry nor an `initial_child` cannot be entered at all —
    /// every composite state must declare an initial substate before it is
    /// reachable.
    fn resolve_entry_leaf(&self, state: StateId) -> Result<StateId, RcError> {
        let node = self.node(state)?;
        if node.children.is_empty() {
            return Ok(state);
        }
        let next = match node.history_mode {
            HistoryMode::None => node.initial_child,
            HistoryMode::Shallow => node.last_active_child.or(node.initial_child),
            HistoryMode::Deep => node.last_active_child.or(node.initial_child),
        };
        match next {
            Some(child) if matches!(node.history_mode, HistoryMode::Deep) => {
                self.resolve_entry_leaf(child)
            }
            Some(child) => {
                // Shallow history / plain initial-child only goes one level;
                // the child's own entry point is itself, not recursively
                // resolved.
                if self.node(child)?.initial_child.is_some() && matches!(node.history_mode, HistoryMode::None) {
                    self.resolve_entry_leaf(child)
                } else {
                    Ok(child)
                }
            }
            None => Err(RcError::NoInitialSubstate),
        }
    }

    fn path_to_root(&self, mut state: StateId) -> Vec<StateId> {
        let mut path = vec![state];
        while let Some(parent) = self.states.get(&state).and_then(|n| n.parent) {
            path.push(parent);
            state = parent;
        }
        path
    }

    /// Transition the active state to `target`, running exit hooks from the
    /// current leaf up to (not including) the lowest common ancestor, then
    /// enter hooks from the common ancestor down to the resolved leaf.
    /// Updates history pointers for every composite ancestor exited.
    pub fn transfer_to_state(&mut self, target: StateId) -> Result<(), RcError> {
        if self.switching.swap(true, Ordering::AcqRel) {
            return Err(RcError::AnotherStateSwitchInProgress);
        }
        let result = self.transfer_to_state_inner(target);
        self.switching.store(false, Ordering::Release);
        result
    }

    fn transfer_to_state_inner(&mut self, target: StateId) -> Result<(), RcError> {
        if !self.states.contains_key(&target) {
            return Err(RcError::StateIsNotAnAgentState);
        }
        let redirected = self.resolve_transfers(target)?;
        let leaf = self.resolve_entry_leaf(redirected)?;

        let from_path = self.path_to_root(self.active);
        let to_path = self.path_to_root(leaf);
        let to_set: HashSet<StateId> = to_path.iter().copied().collect();

        let common_ancestor = from_path.iter().find(|s| to_set.contains(s)).copied();

        // Exit from the current leaf up to (not including) the common ancestor.
        for &state in &from_path {
            if Some(state) == common_ancestor {
                break;
            }
            if let Some(node) = self.states.get(&state) {
                for hook in &node.exit_hooks {
                    hook();
                }
            }
            if let Some(parent) = self.states.get(&state).and_then(|n| n.parent) {
                if let Some(parent_node) = self.states.get_mut(&parent) {
                    parent_node.last_active_child = Some(state);
                }
            }
        }

        // Enter from just below the common ancestor down to the leaf.
        let mut enter_chain: Vec<StateId> = to_path
            .into_iter()
            .take_while(|s| Some(*s) != common_ancestor)
            .collect();
        enter_chain.reverse();
        for state in enter_chain {
            if let Some(node) = self.states.get(&state) {
                for hook in &node.enter_hooks {
                    hook();
                }
            }
        }

        self.active = leaf;
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
