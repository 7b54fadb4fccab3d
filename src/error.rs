//! Stable, externally-visible error codes.
//!
//! `RcError` is the one error type in this crate that derives through
//! `thiserror` — it sits at the boundary embedding applications match against,
//! the same role `lumen-rt`'s service-layer errors (e.g. idempotency, replay)
//! play for their own callers. Hot-path internals (mailbox send, agent
//! dispatch, state transitions) hand-roll `Display`/`Error` in their own
//! modules and convert into an `RcError` only when they cross this boundary.

use thiserror::Error;

/// Stable error codes surfaced across the public API (spec §6).
///
/// `#[non_exhaustive]` because new overflow/validation conditions may be
/// added without that being a breaking change for callers who already match
/// with a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RcError {
    /// A message type has no registered handler in the target state and no
    /// deadletter handler is installed either.
    #[error("no handler found for message of this type in the current state")]
    NoHandlerFound,

    /// A per-type message limit was exceeded and the configured overflow
    /// action is `abort`.
    #[error("message limit exceeded for this type, configured to abort")]
    MsgLimitExceededAbort,

    /// A per-type message limit was exceeded and the configured overflow
    /// action is `throw`.
    #[error("message limit exceeded for this type, configured to throw")]
    MsgLimitExceededThrow,

    /// `transform` was attempted against a service-request call site, which
    /// cannot be transformed on overlimit.
    #[error("service request message cannot be transformed on overlimit")]
    SvcRequestCannotBeTransformedOnOverlimit,

    /// A `transform` overflow action recursed past the configured recursion
    /// depth bound.
    #[error("message-limit transform recursion depth exceeded")]
    TransformRecursionDepthExceeded,

    /// A mailbox/mchain operation was attempted after the mailbox was
    /// closed.
    #[error("mailbox is closed")]
    MboxClosed,

    /// A bounded mchain rejected a send because it is full and the overflow
    /// policy is `abort` (or the policy's retry/wait budget was exhausted).
    #[error("mchain is full")]
    ChainFull,

    /// A coop registration failed because one of its agents could not be
    /// bound (subscription or state setup raised).
    #[error("cooperation registration failed: {0}")]
    CoopDefineError(String),

    /// A coop was asked to deregister while still referenced.
    #[error("cooperation still has {0} outstanding references")]
    CoopStillReferenced(usize),

    /// A state transition named a target state that is not reachable from
    /// the agent's starting state (not in its state tree).
    #[error("target state does not belong to this agent's state tree")]
    StateIsNotAnAgentState,

    /// Composite-state nesting exceeded the configured maximum depth.
    #[error("state nesting depth exceeds the maximum of {0}")]
    MaxSubscriptionDepthExceeded(u8),

    /// The environment was asked to run twice, or stop before it was run.
    #[error("environment is not in a state that allows this operation")]
    EnvironmentNotRunning,

    /// A chain of transfer-to-state subscriptions revisited a state it had
    /// already passed through without ever reaching a final handler.
    #[error("transfer-to-state chain looped back without finding a final handler")]
    TransferToStateLoop,

    /// A composite state was entered but has neither an initial substate nor
    /// a recorded history entry to resume into.
    #[error("composite state has no initial substate defined")]
    NoInitialSubstate,

    /// `set_initial_child` was called twice for the same composite state.
    #[error("initial substate is already defined for this state")]
    InitialSubstateAlreadyDefined,

    /// An operation was attempted against an agent that has already been
    /// deregistered from its cooperation.
    #[error("agent has been deactivated")]
    AgentDeactivated,

    /// A state transition named a state id this agent's state machine has
    /// never heard of.
    #[error("state id is unknown to this agent")]
    AgentUnknownState,

    /// A `change_state`/`transfer_to_state` call was attempted while another
    /// one was already in progress on the same agent.
    #[error("another state switch is already in progress")]
    AnotherStateSwitchInProgress,

    /// A state's configured time limit named a duration that cannot elapse
    /// (e.g. zero, or the target state does not exist).
    #[error("invalid time limit for this state")]
    InvalidTimeLimitForState,

    /// An operation that is only legal on an agent's own working thread was
    /// attempted from another thread.
    #[error("operation is only enabled on the agent's working thread")]
    OperationEnabledOnlyOnAgentWorkingThread,

    /// `recv`/`try_recv` was attempted against an mchain with nothing queued
    /// and no blocking wait requested.
    #[error("message chain is empty")]
    MsgChainIsEmpty,

    /// A bounded mchain rejected a send because it is full.
    #[error("message chain is full")]
    MsgChainIsFull,

    /// A send overran a bounded mchain's capacity under an overflow policy
    /// that reports rather than silently drops.
    #[error("message chain overflow")]
    MsgChainOverflow,

    /// Subscriptions cannot be attached directly to a message chain — they
    /// exist only on direct and named mailboxes.
    #[error("message chain does not support subscriptions")]
    MsgChainDoesntSupportSubscriptions,

    /// Delivery filters cannot be attached directly to a message chain.
    #[error("message chain does not support delivery filters")]
    MsgChainDoesntSupportDeliveryFilters,

    /// A mutable message was sent to a named (MPMC) mailbox, which may fan
    /// the same message out to several subscribers.
    #[error("mutable message cannot be delivered via an MPMC mailbox")]
    MutableMsgCannotBeDeliveredViaMpmcMbox,

    /// A mutable message was scheduled as a periodic timer delivery.
    #[error("mutable message cannot be scheduled periodically")]
    MutableMsgCannotBePeriodic,

    /// A timer was scheduled with a negative initial pause.
    #[error("pause duration cannot be negative")]
    NegativeValueForPause,

    /// A periodic timer was scheduled with a negative period.
    #[error("period duration cannot be negative")]
    NegativeValueForPeriod,

    /// A message type was given to the limit pipeline with no limit
    /// configured for it under a `Fixed` storage policy.
    #[error("message has no limit defined")]
    MessageHasNoLimitDefined,

    /// A message type was given two limit configurations.
    #[error("several limits defined for one message type")]
    SeveralLimitsForOneMessageType,

    /// A stop guard was requested after the environment's stop sequence had
    /// already begun.
    #[error("cannot set a stop guard once stop has started")]
    CannotSetStopGuardWhenStopIsStarted,

    /// A delivery-trace operation was attempted while message tracing is
    /// disabled.
    #[error("message tracing is disabled")]
    MsgTracingDisabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    // === 1. error messages are stable text callers may match substrings of ===
    #[test]
    fn no_handler_found_message() {
        let e = RcError::NoHandlerFound;
        assert_eq!(e.to_string(), "no handler found for message of this type in the current state");
    }

    // === 2. errors carrying data format that data into the message ===
    #[test]
    fn coop_still_referenced_includes_count() {
        let e = RcError::CoopStillReferenced(3);
        assert!(e.to_string().contains('3'));
    }

    // === 3. RcError implements std::error::Error ===
    #[test]
    fn rc_error_is_std_error() {
        let e = RcError::MboxClosed;
        let _: &dyn std::error::Error = &e;
    }
}
