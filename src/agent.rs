//! The agent runtime: demand handlers, the handler-finder, and exception
//! reactions.
//!
//! Grounded on `lumen-rt/src/services/actor.rs`'s `Actor` trait and
//! `spawn_actor` — generalized from that file's single `handle()` entry
//! point to four demand handlers
//! (`evt_start`/`evt_finish`/`on_message`/`on_enveloped_msg`), with the
//! handler-finder inserted between queue-pop and invocation so a message's
//! handler is looked up against the agent's *current* state, walking its
//! ancestor chain via `state::StateMachine::handler_search_path`.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use crate::error::RcError;
use crate::event_queue::{Event, EventQueue};
use crate::ids::{AgentId, MailboxId, Priority, WorkingThread};
use crate::message::{Envelope, HookContext, Invoker, Message};
use crate::state::{StateId, StateMachine};
use crate::subscription::SubscriptionStorage;

/// What an agent's exception reaction handler decides to do after an
/// `on_message`/`on_enveloped_msg` invocation panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionReaction {
    /// Deregister the agent's coop, as if it called `deregister` itself.
    DeregisterCoopNormally,
    /// Deregister the coop and record the panic as an abnormal shutdown
    /// reason.
    DeregisterCoopOnError,
    /// Ignore the panic and keep the agent running.
    Ignore,
    /// Abort the process — used for panics the embedding application has
    /// decided are unrecoverable.
    Abort,
}

/// An agent's exception reaction is resolved by a live walk at throw time:
/// agent → coop → parent coops → environment default, so a reaction set on
/// a coop after a child agent has already registered still takes effect.
/// This trait lets `coop.rs` supply that walk without `agent.rs` depending
/// on `coop.rs` directly.
pub trait ExceptionReactionResolver: Send + Sync {
    fn resolve(&self, agent: AgentId) -> ExceptionReaction;
}

/// Hand-rolled error type for agent-runtime failures — kept outside
/// `thiserror`, matching how `ActorError` in `actor.rs` hand-rolls
/// `Display`/`Error` on its own hot path.
#[derive(Debug)]
pub enum AgentError {
    NoHandlerFound { type_name: &'static str },
    HandlerPanicked { type_name: &'static str },
    /// A chain of transfer-to-state subscriptions revisited a state it had
    /// already passed through without ever reaching a final handler.
    TransferToStateLoop,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::NoHandlerFound { type_name } => {
                write!(f, "no handler found for message type {type_name}")
            }
            AgentError::HandlerPanicked { type_name } => {
                write!(f, "handler for message type {type_name} panicked")
            }
            AgentError::TransferToStateLoop => {
                write!(f, "transfer-to-state chain looped back without finding a final handler")
            }
        }
    }
}

impl std::error::Error for AgentError {}

impl From<AgentError> for RcError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::NoHandlerFound { .. } => RcError::NoHandlerFound,
            AgentError::HandlerPanicked { .. } => RcError::NoHandlerFound,
            AgentError::TransferToStateLoop => RcError::TransferToStateLoop,
        }
    }
}

/// The per-agent runtime state: its id, its state machine, its subscription
/// table, and the working-thread guard required around subscription
/// mutation.
pub struct AgentCore {
    id: AgentId,
    priority: Priority,
    states: StateMachine,
    subscriptions: SubscriptionStorage,
    working_thread: WorkingThread,
    deadletter: Option<Box<dyn FnMut(&mut Message) + Send>>,
    on_start: Option<Box<dyn FnMut() + Send>>,
    on_finish: Option<Box<dyn FnMut() + Send>>,
}

impl AgentCore {
    pub fn new() -> Self {
        Self {
            id: AgentId::next(),
            priority: 0,
            states: StateMachine::new(),
            subscriptions: SubscriptionStorage::new(),
            working_thread: WorkingThread::new(),
            deadletter: None,
            on_start: None,
            on_finish: None,
        }
    }

    /// Run `f` with working-thread status held, giving it exclusive access
    /// to `self` for subscription setup or state-tree construction — the
    /// Rust shape of `so_define_agent`'s "definition point" scope.
    pub fn define<R>(&mut self, f: impl FnOnce(&mut AgentCore) -> R) -> R {
        self.working_thread.acquire();
        let result = f(self);
        self.working_thread.release();
        result
    }

    /// Install the `evt_start` hook, run once when the agent's coop finishes
    /// registration.
    pub fn set_on_start<F: FnMut() + Send + 'static>(&mut self, hook: F) {
        self.on_start = Some(Box::new(hook));
    }

    /// Install the `evt_finish` hook, run once as the agent is torn down.
    pub fn set_on_finish<F: FnMut() + Send + 'static>(&mut self, hook: F) {
        self.on_finish = Some(Box::new(hook));
    }

    /// Run the `evt_start` hook, if any.
    pub fn run_evt_start(&mut self) {
        if let Some(hook) = self.on_start.as_mut() {
            hook();
        }
    }

    /// Run the `evt_finish` hook, if any.
    pub fn run_evt_finish(&mut self) {
        if let Some(hook) = self.on_finish.as_mut() {
            hook();
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Set this agent's registration priority. Ordinarily called from inside
    /// the `define` closure, before the coop reads it back via `priority()`
    /// to place the agent in its coop's descending-priority agent list.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn states(&self) -> &StateMachine {
        &self.states
    }

    pub fn states_mut(&mut self) -> &mut StateMachine {
        &mut self.states
    }

    /// Install the agent-wide deadletter handler, invoked when the
    /// handler-finder exhausts the ancestor search without finding a live
    /// handler.
    pub fn set_deadletter<F: FnMut(&mut Message) + Send + 'static>(&mut self, handler: F) {
        self.deadletter = Some(Box::new(handler));
    }

    /// Subscribe a handler for `(mbox, type, state)`. Must be called while
    /// the calling thread holds working-thread status; this method does
    /// not itself acquire it — callers use `with_working_thread` around a
    /// block of subscription calls, matching `so_define_agent`'s scope.
    pub fn subscribe(
        &mut self,
        mbox: MailboxId,
        type_id: TypeId,
        state: StateId,
        handler: Box<dyn FnMut(&mut Message) + Send>,
    ) {
        debug_assert!(
            self.working_thread.is_current(),
            "subscription storage mutated off the working thread"
        );
        self.subscriptions.subscribe(mbox, type_id, state, handler);
    }

    /// Declare `(mbox, type, state)` as a transfer-to-state subscription:
    /// a matching message switches the agent to `target` instead of
    /// running a handler here, and the handler-finder re-looks-up the same
    /// `(mbox, type)` starting at `target`.
    pub fn subscribe_intermediate(
        &mut self,
        mbox: MailboxId,
        type_id: TypeId,
        state: StateId,
        target: StateId,
    ) {
        debug_assert!(self.working_thread.is_current());
        self.subscriptions.subscribe_intermediate(mbox, type_id, state, target);
    }

    pub fn unsubscribe(&mut self, mbox: MailboxId, type_id: TypeId, state: StateId) {
        debug_assert!(self.working_thread.is_current());
        self.subscriptions.unsubscribe(mbox, type_id, state);
    }

    /// Run a closure with working-thread status held for its duration.
    pub fn with_working_thread<R>(&self, f: impl FnOnce() -> R) -> R {
        self.working_thread.acquire();
        let result = f();
        self.working_thread.release();
        result
    }

    /// The handler-finder: walk the active state's ancestor chain (stopping
    /// early at a suppressing ancestor) looking for a live handler for
    /// `(mbox, type)`, also trying the message's upcaster chain at each
    /// level before moving to the next ancestor. An `intermediate`
    /// (transfer-to-state) match switches the agent's active state and
    /// restarts the search from there, bounded by a visited-state set so a
    /// cycle of transfers surfaces as `TransferToStateLoop` instead of
    /// spinning forever. Returns `Err(NoHandlerFound)` if the walk is
    /// exhausted and no deadletter handler is installed either.
    fn dispatch_classical(&mut self, mbox: MailboxId, mut msg: Message) -> Result<(), AgentError> {
        let type_id = msg.type_id();
        let mut candidates = Vec::with_capacity(1 + msg.upcast_chain().len());
        candidates.push(type_id);
        candidates.extend_from_slice(msg.upcast_chain());

        let mut search_origin = self.states.active();
        let mut visited_origins = std::collections::HashSet::new();

        loop {
            if !visited_origins.insert(search_origin) {
                return Err(AgentError::TransferToStateLoop);
            }
            let path = self.states.handler_search_path(search_origin, type_id);
            let mut transfer_target = None;
            let mut hit_deadletter_marker = false;

            'path: for state in path {
                for &candidate in &candidates {
                    match self.subscriptions.lookup(mbox, candidate, state) {
                        Some(crate::subscription::Lookup::Final(handler)) => {
                            let type_name = msg.type_name();
                            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                                || handler(&mut msg),
                            ));
                            return result.map_err(|_| AgentError::HandlerPanicked { type_name });
                        }
                        Some(crate::subscription::Lookup::Intermediate(target)) => {
                            transfer_target = Some(target);
                            break 'path;
                        }
                        Some(crate::subscription::Lookup::Deadletter) => {
                            hit_deadletter_marker = true;
                            break 'path;
                        }
                        Some(crate::subscription::Lookup::AwaitingDeregistration) | None => {}
                    }
                }
            }

            if hit_deadletter_marker {
                break;
            }
            match transfer_target {
                Some(target) => {
                    self.states
                        .transfer_to_state(target)
                        .map_err(|_| AgentError::TransferToStateLoop)?;
                    search_origin = target;
                    continue;
                }
                None => break,
            }
        }

        if let Some(handler) = self.deadletter.as_mut() {
            handler(&mut msg);
            return Ok(());
        }
        Err(AgentError::NoHandlerFound {
            type_name: msg.type_name(),
        })
    }

    /// Dispatch an enveloped message: the envelope's `access_hook` runs
    /// first with `HookContext::HandlerFound`, and only if it calls through
    /// does the handler-finder run against the inner message. The inner
    /// message may itself be another envelope layer, so the continuation
    /// recurses through `dispatch` rather than jumping straight to
    /// `dispatch_classical` — this is what lets a stack of nested envelopes
    /// (outermost first) all run their hooks before the final handler fires.
    pub fn dispatch_enveloped(
        &mut self,
        mbox: MailboxId,
        envelope: &dyn Envelope,
        inner: Message,
    ) -> Result<(), AgentError> {
        let mut outcome = Ok(());
        let inner_cell = std::cell::RefCell::new(Some(inner));
        envelope.access_hook(HookContext::HandlerFound, Invoker::Pipeline, &mut || {
            if let Some(msg) = inner_cell.borrow_mut().take() {
                outcome = self.dispatch(mbox, msg);
            }
        });
        outcome
    }

    /// Dispatch any message, enveloped or plain, to this agent: unwraps one
    /// envelope layer at a time via `Message::into_envelope_parts`, routing
    /// through `dispatch_enveloped` until the innermost classical message
    /// reaches the handler-finder.
    pub fn dispatch(&mut self, mbox: MailboxId, msg: Message) -> Result<(), AgentError> {
        match msg.into_envelope_parts() {
            Ok((envelope, inner)) => self.dispatch_enveloped(mbox, envelope.as_ref(), inner),
            Err(plain) => self.dispatch_classical(mbox, plain),
        }
    }
}

impl Default for AgentCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Push this agent's queued demands onto `queue` as a single `Demand` event;
/// the reference dispatcher pops demands and calls back into
/// `AgentCore::dispatch_classical`/`dispatch_enveloped` through the
/// environment's demand loop (see `env.rs`).
pub fn schedule_demand(queue: &Arc<dyn EventQueue>, agent: AgentId) {
    queue.push(Event::Demand(agent));
}
