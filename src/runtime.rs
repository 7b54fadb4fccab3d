//! The agent event pump: the glue between a `DirectMailbox`, an
//! `AgentCore`, and the reference `ThreadPoolDispatcher` so that a send into
//! an agent's mbox actually results in its handler running on a pool worker.
//!
//! Grounded on `lumen-rt/src/services/actor.rs`'s `spawn_actor`, which wires
//! an `Actor` impl to a mailbox and a dispatcher the same way: one owned
//! receiver behind a lock, one registered callback the scheduler invokes per
//! event. The mailbox's `RefCell`-backed save queue means only one thread may
//! touch it at a time, so the pump holds mailbox and core together behind a
//! single `parking_lot::Mutex` rather than two independent locks —
//! concurrent `Demand` events for the same agent simply queue up on that
//! lock instead of racing the save queue. Message-limit checking happens
//! earlier, at push time, inside the mailbox's own sender (see
//! `mailbox::direct::DirectSender::send`) — the pump only ever sees messages
//! that have already cleared their limit.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{AgentCore, AgentError, ExceptionReaction, ExceptionReactionResolver};
use crate::coop::{CoopError, CoopExceptionResolver, CoopRegistry, DeregistrationReason};
use crate::dispatch::thread_pool::ThreadPoolDispatcher;
use crate::env::Environment;
use crate::error::RcError;
use crate::event_queue::{Event, EventQueue};
use crate::ids::{AgentId, CoopId, MailboxId};
use crate::limits::LimitRegistry;
use crate::mailbox::direct::{DirectMailbox, DirectSendError, DirectSender};
use crate::mailbox::MailboxRef;
use crate::message::Message;
use crate::state::StateId;
use crate::timer::TimerScheduler;

/// The state one spawned agent's pump owns: its mailbox and its core.
/// Reached only through the executor callback registered with the
/// dispatcher.
struct PumpState {
    core: AgentCore,
    mailbox: DirectMailbox,
}

/// A live, spawned agent: its id, a send handle to its own mbox, and the
/// locked pump state backing it.
#[derive(Clone)]
pub struct AgentHandle {
    id: AgentId,
    sender: DirectSender,
    dispatcher: Arc<ThreadPoolDispatcher>,
    state: Arc<Mutex<PumpState>>,
}

impl AgentHandle {
    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn mbox(&self) -> MailboxId {
        self.sender.id()
    }

    /// A send handle to this agent's own mbox — clone freely, one per
    /// sending thread or subscriber registration.
    pub fn sender(&self) -> DirectSender {
        self.sender.clone()
    }

    /// Send `msg` to this agent's own mbox and wake its pump with a `Demand`
    /// event — the ordinary way an external caller feeds an agent, as
    /// opposed to delivery through a named mailbox's subscriber fan-out,
    /// which already wakes the pump itself through its `WakeFn`.
    pub fn deliver(&self, msg: Message) -> Result<(), DirectSendError> {
        self.sender.send(msg)?;
        self.dispatcher.push(Event::Demand(self.id));
        Ok(())
    }

    /// Run `f` against the agent's core under its pump lock — used by tests
    /// and diagnostics that need to inspect state between sends.
    pub fn with_core<R>(&self, f: impl FnOnce(&AgentCore) -> R) -> R {
        f(&self.state.lock().core)
    }
}

/// Spawn a fresh agent attached to `coop`: builds its `AgentCore` and a
/// `limits`-checked mbox, runs `define` with working-thread status held so
/// it can subscribe handlers, build the state tree, and set its priority,
/// then attaches it to the coop (per `CoopRegistry::attach_agent`) — after
/// `define` so the coop reads back whatever priority `define` set rather
/// than the default — and finally registers the agent's executor and mbox
/// with the environment's dispatcher. Does not push `Event::Start` —
/// callers do that once the whole coop has finished registering, mirroring
/// `finish_registration`'s "bind, then mark registered" ordering.
pub fn spawn_agent(
    env: &Environment,
    coop: CoopId,
    limits: LimitRegistry,
    define: impl FnOnce(&mut AgentCore, MailboxId),
) -> Result<AgentHandle, CoopError> {
    let mut core = AgentCore::new();
    let agent_id = core.id();

    let (sender, mailbox) = DirectMailbox::with_limits(limits);
    let mbox_id = mailbox.id();
    core.define(|core| define(core, mbox_id));

    env.coops().attach_agent(coop, agent_id, core.priority())?;
    env.exception_resolver().bind(agent_id, coop);

    let state = Arc::new(Mutex::new(PumpState { core, mailbox }));

    let dispatcher = Arc::clone(env.dispatcher());
    let coops = Arc::clone(env.coops());
    let exception_resolver = Arc::clone(env.exception_resolver());
    let executor_state = Arc::clone(&state);
    let dispatcher_for_executor = Arc::clone(&dispatcher);

    dispatcher.register_agent(
        agent_id,
        Arc::new(move |event| {
            run_event(
                &executor_state,
                mbox_id,
                coop,
                agent_id,
                event,
                &dispatcher_for_executor,
                &coops,
                &exception_resolver,
            )
        }),
    );
    dispatcher.register_mailbox(MailboxRef::Direct(sender.clone()));
    dispatcher.register_mailbox_owner(mbox_id, agent_id);

    Ok(AgentHandle {
        id: agent_id,
        sender,
        dispatcher,
        state,
    })
}

/// Dispatch one pushed event to an agent's pump.
fn run_event(
    state: &Arc<Mutex<PumpState>>,
    mbox_id: MailboxId,
    coop: CoopId,
    agent_id: AgentId,
    event: Event,
    dispatcher: &Arc<ThreadPoolDispatcher>,
    coops: &Arc<CoopRegistry>,
    exception_resolver: &Arc<CoopExceptionResolver>,
) {
    match event {
        Event::Start(_) => {
            state.lock().core.run_evt_start();
        }
        Event::Demand(_) => {
            drain_demand(state, mbox_id, agent_id, coop, dispatcher, coops, exception_resolver);
        }
        Event::Finish(_) => {
            state.lock().core.run_evt_finish();
            dispatcher.unregister_agent(agent_id);
            dispatcher.unregister_mailbox(mbox_id);
        }
    }
}

/// Push `Event::Finish` for every agent `deregister` reports as stopped.
fn push_finish_events(dispatcher: &Arc<ThreadPoolDispatcher>, stopped: &[AgentId]) {
    for agent in stopped {
        dispatcher.push(Event::Finish(*agent));
    }
}

/// Drain and dispatch every currently-queued message for one `Demand` event,
/// resolving the agent's exception reaction if a handler panics. Each
/// message already cleared its type's delivery limit at push time (see
/// `mailbox::direct::DirectSender::send`), so dispatch here never rechecks
/// it.
fn drain_demand(
    state: &Arc<Mutex<PumpState>>,
    mbox_id: MailboxId,
    agent_id: AgentId,
    coop: CoopId,
    dispatcher: &Arc<ThreadPoolDispatcher>,
    coops: &Arc<CoopRegistry>,
    exception_resolver: &Arc<CoopExceptionResolver>,
) {
    loop {
        let mut guard = state.lock();
        let Some(msg) = guard.mailbox.try_recv() else {
            return;
        };
        if intercept_state_timeout(&mut guard.core, &msg) {
            continue;
        }
        let outcome = guard.core.dispatch(mbox_id, msg);
        drop(guard);

        if let Err(AgentError::HandlerPanicked { type_name }) = outcome {
            tracing::warn!(target: "delivery_trace", agent = ?agent_id, type_name, "handler panicked");
            match exception_resolver.resolve(agent_id) {
                ExceptionReaction::Ignore => {}
                ExceptionReaction::Abort => std::process::abort(),
                ExceptionReaction::DeregisterCoopNormally => {
                    if let Ok(stopped) = coops.deregister(coop, DeregistrationReason::Normal) {
                        push_finish_events(dispatcher, &stopped);
                    }
                    return;
                }
                ExceptionReaction::DeregisterCoopOnError => {
                    if let Ok(stopped) = coops.deregister(coop, DeregistrationReason::UnhandledException) {
                        push_finish_events(dispatcher, &stopped);
                    }
                    return;
                }
            }
        }
    }
}

/// Deregister a coop and drive each of its stopped agents' `evt_finish`
/// through the dispatcher: `CoopRegistry::deregister` only updates the coop
/// graph, so this pushes the matching `Event::Finish` for every agent it
/// names, keeping the two halves of teardown (bookkeeping, lifecycle
/// events) in sync.
pub fn deregister_coop(env: &Environment, coop: CoopId, reason: DeregistrationReason) -> Result<Vec<AgentId>, CoopError> {
    let stopped = env.coops().deregister(coop, reason)?;
    push_finish_events(env.dispatcher(), &stopped);
    Ok(stopped)
}

/// The internal marker delivered when a state's time limit expires. Carries
/// both the state the timer was armed for and where to transfer if it is
/// still active, so the pump can perform the transfer itself without a
/// second lookup against the (possibly since-changed) state tree.
struct StateTimeoutTick {
    origin: StateId,
    target: StateId,
}

/// Wire a state's declared time limit to a live timer: installs an
/// `on_enter` hook that schedules a one-shot timer addressed to the agent's
/// own mbox, and an `on_exit` hook that cancels it. The timer's target
/// message is a `StateTimeoutTick`; `drain_demand` recognizes this type
/// ahead of the ordinary handler-finder and performs the transfer itself,
/// since `AgentCore::dispatch` hands handlers only a `&mut Message`, never
/// `&mut AgentCore` — the transfer cannot be expressed as an ordinary
/// subscribed handler body.
///
/// Must be called while `state` has a time limit configured (via
/// `StateMachine::set_time_limit`); a no-op otherwise.
pub fn wire_state_time_limit(
    core: &mut AgentCore,
    timers: &Arc<TimerScheduler>,
    mbox: MailboxId,
    state: StateId,
) -> Result<(), RcError> {
    let Some((duration, target)) = core.states().time_limit(state)? else {
        return Ok(());
    };
    let pending = Arc::new(Mutex::new(None));

    let pending_enter = Arc::clone(&pending);
    let timers_enter = Arc::clone(timers);
    core.states_mut().on_enter(state, move || {
        let id = timers_enter
            .schedule_once(duration, mbox, true, move || {
                Message::classical(StateTimeoutTick { origin: state, target })
            })
            .expect("state-timeout tick is always immutable and direct-addressed");
        *pending_enter.lock() = Some(id);
    })?;

    let pending_exit = Arc::clone(&pending);
    let timers_exit = Arc::clone(timers);
    core.states_mut().on_exit(state, move || {
        if let Some(id) = pending_exit.lock().take() {
            timers_exit.cancel(id);
        }
    })?;

    Ok(())
}

/// Intercept a just-dequeued message for a `StateTimeoutTick` before it
/// reaches the ordinary handler-finder, performing the configured transfer
/// directly against `core`. Returns `true` if the message was a tick and was
/// consumed here (whether or not the transfer actually ran — a tick whose
/// origin is no longer active is a stale race with an in-flight exit and is
/// simply dropped); `false` means the caller should dispatch it normally.
fn intercept_state_timeout(core: &mut AgentCore, msg: &Message) -> bool {
    match msg.downcast_ref::<StateTimeoutTick>() {
        Some(tick) => {
            if core.states().active() == tick.origin {
                let _ = core.states_mut().transfer_to_state(tick.target);
            }
            true
        }
        None => false,
    }
}
