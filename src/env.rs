//! The `Environment`: construction/teardown order, `run()`/`stop()`
//! orchestration, and the auto-shutdown guard.
//!
//! Grounded on `lumen-rt`'s `lib.rs` module wiring order (services
//! constructed bottom-up, torn down top-down) and `registry-server`'s
//! builder-style app-state construction for the `EnvironmentParams` shape.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::agent::ExceptionReaction;
use crate::coop::{CoopExceptionResolver, CoopRegistry, DeregistrationReason};
use crate::diag::{snapshot_coop_graph, CoopGraphSnapshot};
use crate::dispatch::thread_pool::ThreadPoolDispatcher;
use crate::error::RcError;
use crate::event_queue::EventQueue;
use crate::ids::CoopId;
use crate::timer::TimerScheduler;

/// Builder for an `Environment`: every ambient dependency (worker count,
/// default exception reaction, timer routing) is set here before `build()`
/// constructs the wired-up runtime.
pub struct EnvironmentParams {
    worker_threads: usize,
    default_exception_reaction: ExceptionReaction,
}

impl EnvironmentParams {
    pub fn new() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            default_exception_reaction: ExceptionReaction::DeregisterCoopOnError,
        }
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.max(1);
        self
    }

    pub fn default_exception_reaction(mut self, reaction: ExceptionReaction) -> Self {
        self.default_exception_reaction = reaction;
        self
    }

    pub fn build(self) -> Environment {
        Environment::new(self)
    }
}

impl Default for EnvironmentParams {
    fn default() -> Self {
        Self::new()
    }
}

/// The root object embedding applications construct: owns the coop
/// registry, the reference dispatcher, and the timer facility, and
/// orchestrates `run()`/`stop()`.
pub struct Environment {
    run_id: Uuid,
    dispatcher: Arc<ThreadPoolDispatcher>,
    coops: Arc<CoopRegistry>,
    exception_resolver: Arc<CoopExceptionResolver>,
    timers: Arc<TimerScheduler>,
    running: AtomicBool,
    /// Counts coops that have asked the environment to auto-shutdown once
    /// they deregister. Implemented as an explicit atomic counter rather
    /// than an RAII guard object since guards must be released from
    /// arbitrary threads at arbitrary times.
    init_guard_count: AtomicUsize,
}

impl Environment {
    fn new(params: EnvironmentParams) -> Self {
        let dispatcher = ThreadPoolDispatcher::new(params.worker_threads);
        let coops = CoopRegistry::new(params.default_exception_reaction);
        let exception_resolver = CoopExceptionResolver::new(Arc::clone(&coops));
        let dispatcher_for_timer = Arc::clone(&dispatcher);
        let timers = Arc::new(TimerScheduler::start(move |target, msg| {
            dispatcher_for_timer.route_timer_delivery(target, msg);
        }));
        tracing::info!(target: "delivery_trace", "environment constructed");
        Self {
            run_id: Uuid::new_v4(),
            dispatcher,
            coops,
            exception_resolver,
            timers,
            running: AtomicBool::new(false),
            init_guard_count: AtomicUsize::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn coops(&self) -> &Arc<CoopRegistry> {
        &self.coops
    }

    pub fn exception_resolver(&self) -> &Arc<CoopExceptionResolver> {
        &self.exception_resolver
    }

    pub fn dispatcher(&self) -> &Arc<ThreadPoolDispatcher> {
        &self.dispatcher
    }

    pub fn timers(&self) -> &Arc<TimerScheduler> {
        &self.timers
    }

    /// Start the environment: flips the running flag and begins accepting
    /// dispatcher work. Calling `run()` twice is rejected.
    pub fn run(&self) -> Result<(), RcError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RcError::EnvironmentNotRunning);
        }
        tracing::info!(target: "delivery_trace", run_id = %self.run_id, "environment running");
        Ok(())
    }

    /// Register a coop whose complete deregistration should trigger
    /// `stop()` automatically once no other guard is outstanding.
    pub fn add_shutdown_guard(&self) {
        self.init_guard_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a previously added shutdown guard; if this was the last one,
    /// stop the environment.
    pub fn release_shutdown_guard(&self) {
        let prev = self.init_guard_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let _ = self.stop();
        }
    }

    /// Deregister a coop and release its share of the shutdown guard, if
    /// any was registered through `add_shutdown_guard`.
    pub fn deregister_coop(&self, coop: CoopId, reason: DeregistrationReason) -> Result<(), RcError> {
        self.coops.deregister(coop, reason).map_err(RcError::from)?;
        Ok(())
    }

    /// Stop the environment: flips the running flag off. Idempotent.
    pub fn stop(&self) -> Result<(), RcError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(target: "delivery_trace", run_id = %self.run_id, "environment stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Snapshot the current coop graph for logging or test assertions.
    pub fn diagnostic_dump(&self) -> CoopGraphSnapshot {
        let ids = self.coops.all_coop_ids();
        snapshot_coop_graph(&self.coops, &ids)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // === 1. run() then run() again is rejected ===
    #[test]
    fn run_twice_is_rejected() {
        let env = EnvironmentParams::new().worker_threads(1).build();
        env.run().unwrap();
        assert!(env.run().is_err());
    }

    // === 2. stop() is idempotent ===
    #[test]
    fn stop_is_idempotent() {
        let env = EnvironmentParams::new().worker_threads(1).build();
        env.run().unwrap();
        env.stop().unwrap();
        env.stop().unwrap();
        assert!(!env.is_running());
    }

    // === 3. the last shutdown guard release stops the environment ===
    #[test]
    fn last_guard_release_stops_environment() {
        let env = EnvironmentParams::new().worker_threads(1).build();
        env.run().unwrap();
        env.add_shutdown_guard();
        env.add_shutdown_guard();
        env.release_shutdown_guard();
        assert!(env.is_running());
        env.release_shutdown_guard();
        assert!(!env.is_running());
    }

    // === 4. builder defaults produce a usable environment ===
    #[test]
    fn builder_defaults_produce_usable_environment() {
        let env = EnvironmentParams::new().build();
        assert!(!env.is_running());
        env.run().unwrap();
        assert!(env.is_running());
    }

    // === 5. diagnostic_dump reflects coops registered through the environment ===
    #[test]
    fn diagnostic_dump_reflects_registered_coops() {
        let env = EnvironmentParams::new().worker_threads(1).build();
        let coop = env.coops().begin_registration(None);
        env.coops().finish_registration(coop);

        let snap = env.diagnostic_dump();
        assert_eq!(snap.coops.len(), 1);
        assert_eq!(snap.coops[0].coop_id, coop.as_u64());
        assert!(snap.to_json().contains("\"registered\": true"));
    }
}
