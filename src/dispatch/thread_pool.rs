//! A work-stealing reference dispatcher.
//!
//! Grounded directly on `lumen-runtime/src/scheduler.rs`: a global
//! `crossbeam_deque::Injector<Event>` fed by `EventQueue::push`, one
//! `Worker<Event>` per thread with `Stealer` handles shared so idle workers
//! steal from busy peers, the same steal-half-from-a-random-peer shape that
//! file's `try_steal` uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::RwLock;

use crate::event_queue::{Event, EventQueue};
use crate::ids::{AgentId, MailboxId};
use crate::mailbox::MailboxRef;
use crate::message::Message;

/// Callback an owner installs so the dispatcher can actually run an agent's
/// lifecycle events without depending on `agent.rs` types directly — this
/// keeps the dispatcher a thin, swappable reference implementation rather
/// than the one true execution path.
pub type AgentExecutor = Arc<dyn Fn(Event) + Send + Sync>;

struct Shared {
    injector: Injector<Event>,
    stealers: RwLock<Vec<Stealer<Event>>>,
    shutdown: AtomicBool,
    executors: RwLock<HashMap<AgentId, AgentExecutor>>,
    mailboxes: RwLock<HashMap<MailboxId, MailboxRef>>,
    mailbox_owners: RwLock<HashMap<MailboxId, AgentId>>,
}

/// The work-stealing thread pool itself.
pub struct ThreadPoolDispatcher {
    shared: Arc<Shared>,
    workers: parking_lot::Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ThreadPoolDispatcher {
    pub fn new(num_workers: usize) -> Arc<Self> {
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: RwLock::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            executors: RwLock::new(HashMap::new()),
            mailboxes: RwLock::new(HashMap::new()),
            mailbox_owners: RwLock::new(HashMap::new()),
        });

        let mut local_workers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers.max(1) {
            let worker = Worker::new_fifo();
            shared.stealers.write().push(worker.stealer());
            local_workers.push(worker);
        }

        let mut handles = Vec::with_capacity(local_workers.len());
        for (idx, worker) in local_workers.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("dispatch-worker-{idx}"))
                .spawn(move || worker_loop(shared, worker))
                .expect("failed to spawn dispatch worker thread");
            handles.push(handle);
        }

        Arc::new(Self {
            shared,
            workers: parking_lot::Mutex::new(handles),
        })
    }

    /// Install the executor callback for `agent`. Replaces any prior
    /// registration.
    pub fn register_agent(&self, agent: AgentId, executor: AgentExecutor) {
        self.shared.executors.write().insert(agent, executor);
    }

    pub fn unregister_agent(&self, agent: AgentId) {
        self.shared.executors.write().remove(&agent);
    }

    /// Register a mailbox so timer deliveries addressed to its id can be
    /// routed without the timer facility needing to know about the mailbox
    /// fabric directly.
    pub fn register_mailbox(&self, mbox: MailboxRef) {
        self.shared.mailboxes.write().insert(mbox.id(), mbox);
    }

    pub fn unregister_mailbox(&self, id: MailboxId) {
        self.shared.mailboxes.write().remove(&id);
        self.shared.mailbox_owners.write().remove(&id);
    }

    /// Record that `mbox` is a direct mailbox owned by `agent`, so a timer
    /// delivery addressed to it also wakes the agent's pump with a `Demand`
    /// event — a plain `send` has no such side effect on its own, matching
    /// the rest of the fabric (a caller sending straight to a `DirectSender`
    /// must push its own `Demand`, same as a named mailbox's subscriber
    /// `wake` callback does on its behalf).
    pub fn register_mailbox_owner(&self, mbox: MailboxId, agent: AgentId) {
        self.shared.mailbox_owners.write().insert(mbox, agent);
    }

    /// Deliver a timer-built message to its registered mailbox target, then
    /// wake the owning agent's pump if one was registered for it.
    pub fn route_timer_delivery(&self, target: MailboxId, msg: Message) {
        if let Some(mbox) = self.shared.mailboxes.read().get(&target) {
            let _ = mbox.send_nonblocking(msg);
        }
        if let Some(agent) = self.shared.mailbox_owners.read().get(&target).copied() {
            self.push(Event::Demand(agent));
        }
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EventQueue for ThreadPoolDispatcher {
    fn push(&self, event: Event) {
        self.shared.injector.push(event);
    }
}

fn agent_of(event: &Event) -> AgentId {
    match event {
        Event::Start(id) | Event::Demand(id) | Event::Finish(id) => *id,
    }
}

fn worker_loop(shared: Arc<Shared>, local: Worker<Event>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let task = local.pop().or_else(|| loop {
            match shared.injector.steal_batch_and_pop(&local) {
                Steal::Success(task) => break Some(task),
                Steal::Empty => break None,
                Steal::Retry => continue,
            }
        });
        let task = task.or_else(|| steal_from_peers(&shared, &local));

        match task {
            Some(event) => {
                let agent = agent_of(&event);
                let executor = shared.executors.read().get(&agent).cloned();
                if let Some(executor) = executor {
                    executor(event);
                }
            }
            None => std::thread::sleep(std::time::Duration::from_micros(200)),
        }
    }
}

fn steal_from_peers(shared: &Shared, local: &Worker<Event>) -> Option<Event> {
    let stealers = shared.stealers.read();
    for stealer in stealers.iter() {
        loop {
            match stealer.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}
