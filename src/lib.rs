//! An in-process actor runtime: a mailbox fabric (direct, named, and bounded
//! mchains), a hierarchical agent state machine, an enveloped-message
//! protocol, and a cooperation lifecycle tying agents together under shared
//! registration/teardown.
//!
//! Module wiring follows `lumen-rt`'s own lib.rs order: identifiers and the
//! message envelope first, then the mailbox fabric and its supporting
//! registries (limits, filters, subscriptions), then the agent and its
//! hierarchical state machine, then the cooperation lifecycle, then the
//! dispatcher and timer facilities that drive everything, and finally the
//! environment that wires it all together.

pub mod ids;
pub mod message;

pub mod limits;
pub mod filters;
pub mod subscription;
pub mod mailbox;

pub mod state;
pub mod agent;
pub mod coop;

pub mod event_queue;
pub mod timer;
pub mod dispatch;

pub mod env;
pub mod error;
pub mod diag;

pub mod runtime;

pub use agent::{AgentCore, AgentError, ExceptionReaction, ExceptionReactionResolver};
pub use coop::{CoopError, CoopExceptionResolver, CoopRegistry, DeregistrationReason};
pub use diag::{CoopGraphSnapshot, CoopSnapshot};
pub use env::{Environment, EnvironmentParams};
pub use error::RcError;
pub use event_queue::{Event, EventQueue, EventQueueHook, ObservedEventQueue};
pub use ids::{AgentId, CoopId, MailboxId, Priority};
pub use limits::{CounterGuard, LimitCheck, LimitConfig, LimitRegistry, OverflowAction, PushOutcome, TransformOutcome};
pub use mailbox::{DirectMailbox, MailboxRef, Mchain, NamedMailbox, OverflowPolicy, PushMode};
pub use message::{Envelope, HookContext, Invoker, Message, MessageKind, Mutability};
pub use runtime::{deregister_coop, spawn_agent, wire_state_time_limit, AgentHandle};
pub use state::{HistoryMode, StateId, StateMachine};
pub use timer::{TimerId, TimerScheduler};
