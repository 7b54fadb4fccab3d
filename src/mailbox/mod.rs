//! The mailbox fabric: direct (MPSC) mailboxes, named (MPMC) mailboxes, and
//! bounded mchains, unified behind a small addressing enum so the agent
//! runtime and environment can hold a mixed collection of destinations.

pub mod direct;
pub mod mchain;
pub mod named;

use crate::ids::MailboxId;
use crate::message::Message;

pub use direct::{DirectMailbox, DirectSendError, DirectSender};
pub use mchain::{ChainClosedError, ChainFullError, CloseMode, Mchain, OverflowPolicy, PushMode, SelectCase};
pub use named::{CloneFn, MutableViaMpmcError, NamedMailbox, WakeFn};

/// A send-only handle to any mailbox kind in the fabric, addressed uniformly
/// by the agent runtime and the environment's diagnostic dumps.
#[derive(Clone)]
pub enum MailboxRef {
    Direct(DirectSender),
    Named(std::sync::Arc<NamedMailbox>),
    Chain(Mchain),
}

impl MailboxRef {
    pub fn id(&self) -> MailboxId {
        match self {
            MailboxRef::Direct(s) => s.id(),
            MailboxRef::Named(n) => n.id(),
            MailboxRef::Chain(c) => c.id(),
        }
    }

    /// Send a pre-addressed message. Named mboxes ignore the return value's
    /// delivered-count (fan-out is best-effort); direct and chain sends
    /// surface their errors as a boxed `std::error::Error` so callers get a
    /// uniform failure type regardless of destination kind.
    pub fn send(&self, msg: Message) -> Result<(), Box<dyn std::error::Error + Send>> {
        match self {
            MailboxRef::Direct(s) => s.send(msg).map_err(|e| Box::new(e) as _),
            MailboxRef::Named(n) => n.deliver(msg).map(|_| ()).map_err(|e| Box::new(e) as _),
            MailboxRef::Chain(c) => c.send(msg).map_err(|e| Box::new(e) as _),
        }
    }

    /// Send via the nonblocking push mode. Direct and named mboxes have no
    /// blocking overflow behavior to begin with, so this only differs from
    /// `send` for `MailboxRef::Chain` — used by periodic timer delivery,
    /// which must never wait on a full mchain or throw on overflow.
    pub fn send_nonblocking(&self, msg: Message) -> Result<(), Box<dyn std::error::Error + Send>> {
        match self {
            MailboxRef::Direct(s) => s.send(msg).map_err(|e| Box::new(e) as _),
            MailboxRef::Named(n) => n.deliver(msg).map(|_| ()).map_err(|e| Box::new(e) as _),
            MailboxRef::Chain(c) => c.push(msg, mchain::PushMode::Nonblocking).map_err(|e| Box::new(e) as _),
        }
    }
}
