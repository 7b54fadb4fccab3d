//! The direct (MPSC) mailbox: every agent owns exactly one, used as the
//! delivery endpoint for messages addressed straight to it.
//!
//! Grounded on `lumen-rt/src/services/mailbox.rs`'s `Mailbox<T>` — unbounded
//! `crossbeam_channel`, a `save_queue` for values pulled out of order by a
//! predicate-based receive, `recv_timeout`. We reuse that shape directly;
//! the main addition here is that the stored element is always a routed
//! `Message` (or envelope) rather than an arbitrary `T`, paired with the
//! message-limit `CounterGuard` (if any) taken out at push time — the guard
//! rides alongside its message through the channel and save queue, and is
//! dropped the instant the message is popped back out, which is the only
//! place the limit counter it guards is ever decremented.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as cb;
use parking_lot::Mutex;

use crate::error::RcError;
use crate::ids::MailboxId;
use crate::limits::{self, CounterGuard, LimitRegistry, PushOutcome};
use crate::message::Message;

type Slot = (Message, Option<CounterGuard>);

/// Error returned when a send to a direct mbox cannot be delivered.
#[derive(Debug)]
pub enum DirectSendError {
    /// The receiving end has been dropped.
    Disconnected(Message),
    /// The message's type is over its configured delivery limit and the
    /// configured overflow action is `Throw`.
    LimitExceeded(RcError),
}

impl fmt::Display for DirectSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectSendError::Disconnected(_) => write!(f, "direct mbox receiver has been dropped"),
            DirectSendError::LimitExceeded(err) => write!(f, "message limit exceeded: {err}"),
        }
    }
}

impl std::error::Error for DirectSendError {}

/// The sending half of a direct mbox. Cheap to clone — every subscriber that
/// knows an agent's address holds one of these.
#[derive(Clone)]
pub struct DirectSender {
    id: MailboxId,
    inner: cb::Sender<Slot>,
    limits: Option<Arc<Mutex<LimitRegistry>>>,
}

impl DirectSender {
    pub fn id(&self) -> MailboxId {
        self.id
    }

    /// Check `msg` against this mbox's limit registry (if any), then push.
    /// The limit check and the increment it performs both happen here, at
    /// push time — the matching decrement happens once, unconditionally,
    /// when the message is popped back out on the receiving side.
    pub fn send(&self, msg: Message) -> Result<(), DirectSendError> {
        match &self.limits {
            None => self.inner.send((msg, None)).map_err(|e| DirectSendError::Disconnected(e.0 .0)),
            Some(limits) => {
                let outcome =
                    limits::check_and_apply(&mut limits.lock(), msg, 0).map_err(DirectSendError::LimitExceeded)?;
                match outcome {
                    PushOutcome::Deliver { message, guard } => self
                        .inner
                        .send((message, guard))
                        .map_err(|e| DirectSendError::Disconnected(e.0 .0)),
                    PushOutcome::Dropped => Ok(()),
                }
            }
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.is_disconnected()
    }
}

/// The receiving half, owned by the agent the mbox belongs to.
pub struct DirectMailbox {
    id: MailboxId,
    inner: cb::Receiver<Slot>,
    save_queue: RefCell<VecDeque<Slot>>,
}

impl DirectMailbox {
    /// Create a fresh direct mbox and its sender, with no message-limit
    /// registry — every send always delivers.
    pub fn new() -> (DirectSender, DirectMailbox) {
        let id = MailboxId::next();
        let (tx, rx) = cb::unbounded();
        (
            DirectSender { id, inner: tx, limits: None },
            DirectMailbox {
                id,
                inner: rx,
                save_queue: RefCell::new(VecDeque::new()),
            },
        )
    }

    /// Create a fresh direct mbox whose sender checks `limits` against every
    /// push before it is delivered.
    pub fn with_limits(limits: LimitRegistry) -> (DirectSender, DirectMailbox) {
        let id = MailboxId::next();
        let (tx, rx) = cb::unbounded();
        (
            DirectSender {
                id,
                inner: tx,
                limits: Some(Arc::new(Mutex::new(limits))),
            },
            DirectMailbox {
                id,
                inner: rx,
                save_queue: RefCell::new(VecDeque::new()),
            },
        )
    }

    pub fn id(&self) -> MailboxId {
        self.id
    }

    /// Receive the next message, preferring anything already pulled back out
    /// of order into the save queue.
    pub fn recv(&self) -> Result<Message, cb::RecvError> {
        if let Some((msg, _guard)) = self.save_queue.borrow_mut().pop_front() {
            return Ok(msg);
        }
        self.inner.recv().map(|(msg, _guard)| msg)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message, cb::RecvTimeoutError> {
        if let Some((msg, _guard)) = self.save_queue.borrow_mut().pop_front() {
            return Ok(msg);
        }
        self.inner.recv_timeout(timeout).map(|(msg, _guard)| msg)
    }

    /// Non-blocking receive, used by the agent pump to drain a mbox between
    /// `Demand` events without parking a worker thread.
    pub fn try_recv(&self) -> Option<Message> {
        if let Some((msg, _guard)) = self.save_queue.borrow_mut().pop_front() {
            return Some(msg);
        }
        self.inner.try_recv().ok().map(|(msg, _guard)| msg)
    }

    /// Selective receive: scan the channel (and any previously saved
    /// messages) for the first message matching `predicate`, pushing
    /// everything skipped over into the save queue in arrival order so a
    /// later selective or ordinary receive still sees it.
    pub fn recv_selective<F>(&self, predicate: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        {
            let mut saved = self.save_queue.borrow_mut();
            if let Some(pos) = saved.iter().position(|(msg, _)| predicate(msg)) {
                return saved.remove(pos).map(|(msg, _guard)| msg);
            }
        }
        let mut skipped = Vec::new();
        let found = loop {
            match self.inner.try_recv() {
                Ok((msg, guard)) => {
                    if predicate(&msg) {
                        break Some(msg);
                    }
                    skipped.push((msg, guard));
                }
                Err(_) => break None,
            }
        };
        let mut saved = self.save_queue.borrow_mut();
        for slot in skipped {
            saved.push_back(slot);
        }
        found
    }

    pub fn len(&self) -> usize {
        self.inner.len() + self.save_queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save_queue_len(&self) -> usize {
        self.save_queue.borrow().len()
    }

    /// Drain every pending message, save queue first, in delivery order.
    pub fn drain(&self) -> Vec<Message> {
        let mut out: Vec<Message> = self.save_queue.borrow_mut().drain(..).map(|(msg, _guard)| msg).collect();
        while let Ok((msg, _guard)) = self.inner.try_recv() {
            out.push(msg);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tick(u32);

    // === 1. basic send/recv round trip ===
    #[test]
    fn send_and_recv() {
        let (tx, rx) = DirectMailbox::new();
        tx.send(Message::classical(Tick(1))).unwrap();
        let msg = rx.recv().unwrap();
        assert_eq!(msg.downcast_ref::<Tick>().unwrap().0, 1);
    }

    // === 2. sender id matches mailbox id ===
    #[test]
    fn sender_and_mailbox_share_id() {
        let (tx, rx) = DirectMailbox::new();
        assert_eq!(tx.id(), rx.id());
    }

    // === 3. recv_timeout times out on an empty mbox ===
    #[test]
    fn recv_timeout_expires() {
        let (_tx, rx) = DirectMailbox::new();
        let result = rx.recv_timeout(Duration::from_millis(10));
        assert!(result.is_err());
    }

    // === 4. selective receive skips non-matching and saves them ===
    #[test]
    fn selective_receive_saves_skipped() {
        let (tx, rx) = DirectMailbox::new();
        tx.send(Message::classical(Tick(1))).unwrap();
        tx.send(Message::classical(Tick(2))).unwrap();
        tx.send(Message::classical(Tick(3))).unwrap();

        let found = rx
            .recv_selective(|m| m.downcast_ref::<Tick>().map(|t| t.0 == 2).unwrap_or(false))
            .unwrap();
        assert_eq!(found.downcast_ref::<Tick>().unwrap().0, 2);
        assert_eq!(rx.save_queue_len(), 2);

        // the skipped messages come back out in original arrival order
        let first = rx.recv().unwrap();
        assert_eq!(first.downcast_ref::<Tick>().unwrap().0, 1);
        let second = rx.recv().unwrap();
        assert_eq!(second.downcast_ref::<Tick>().unwrap().0, 3);
    }

    // === 5. drain empties both the save queue and channel ===
    #[test]
    fn drain_empties_everything() {
        let (tx, rx) = DirectMailbox::new();
        tx.send(Message::classical(Tick(1))).unwrap();
        tx.send(Message::classical(Tick(2))).unwrap();
        rx.recv_selective(|m| m.downcast_ref::<Tick>().map(|t| t.0 == 2).unwrap_or(false));
        let drained = rx.drain();
        assert_eq!(drained.len(), 1);
        assert!(rx.is_empty());
    }

    // === 6. send after the receiver is dropped fails ===
    #[test]
    fn send_after_drop_fails() {
        let (tx, rx) = DirectMailbox::new();
        drop(rx);
        let result = tx.send(Message::classical(Tick(1)));
        assert!(matches!(result, Err(DirectSendError::Disconnected(_))));
    }

    // === 7. try_recv drains the save queue first, then the channel, without blocking ===
    #[test]
    fn try_recv_prefers_save_queue_then_channel() {
        let (tx, rx) = DirectMailbox::new();
        assert!(rx.try_recv().is_none());
        tx.send(Message::classical(Tick(1))).unwrap();
        tx.send(Message::classical(Tick(2))).unwrap();
        rx.recv_selective(|m| m.downcast_ref::<Tick>().map(|t| t.0 == 2).unwrap_or(false));
        assert_eq!(rx.try_recv().unwrap().downcast_ref::<Tick>().unwrap().0, 1);
        assert!(rx.try_recv().is_none());
    }

    // === 8. a limit-guarded send increments at push, and the counter frees
    // as soon as the message is popped back out, before any handler runs ===
    #[test]
    fn with_limits_decrements_counter_on_pop() {
        use crate::limits::{LimitConfig, LimitRegistry, OverflowAction};

        let mut limits = LimitRegistry::fixed(4);
        limits.set_limit(
            std::any::TypeId::of::<Tick>(),
            LimitConfig { capacity: 1, action: OverflowAction::Throw },
        );
        let (tx, rx) = DirectMailbox::with_limits(limits);

        tx.send(Message::classical(Tick(1))).unwrap();
        // over limit while the first message is still queued
        let result = tx.send(Message::classical(Tick(2)));
        assert!(matches!(result, Err(DirectSendError::LimitExceeded(_))));

        // popping the first message frees its slot for a new send
        rx.try_recv().unwrap();
        tx.send(Message::classical(Tick(3))).unwrap();
    }
}
