//! Type-erased message envelopes.
//!
//! The agent runtime and mailbox fabric never know a message's concrete Rust
//! type once it has left the sender's hands — they route on `TypeId` and a
//! small `MessageKind` tag. This mirrors the wrap-in-an-enum idiom
//! `lumen-rt`'s internal `actor::Envelope<M>` uses for its own
//! message-or-stop-signal split, generalized here to an open-ended,
//! nestable envelope: user envelopes may wrap other envelopes, forming
//! upcasting chains.

use std::any::{Any, TypeId};
use std::fmt;

/// What kind of thing a message is, independent of its payload type.
///
/// Distinguishing `Signal` lets the limit/filter/subscription layers skip
/// payload-carrying logic for zero-sized marker types, and lets
/// `transform`'s recursion guard treat `Enveloped` specially (an enveloped
/// message can itself be transformed into another enveloped message, so the
/// depth counter must track unwinding, not payload identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A classical message: carries a payload, delivered by reference to
    /// immutable handlers unless `Mutability::Mutable` is set.
    Classical,
    /// A zero-sized signal: carries no payload, only a type identity.
    Signal,
    /// A user-defined envelope wrapping another message or envelope.
    Enveloped,
    /// A service-request envelope carrying a completion slot (see
    /// `ServiceRequestEnvelope` below). Rejected by `transform` overflow
    /// actions.
    ServiceRequest,
}

/// Whether a message payload may be mutated by its handler before being
/// redelivered to the next subscriber in a mbox's dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    Immutable,
    Mutable,
}

/// The context under which `Envelope::access_hook` is invoked: handler
/// dispatch, overflow transformation, or passive inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookContext {
    /// A handler was found and is about to run.
    HandlerFound,
    /// The message is being transformed by an overflow action.
    Transformation,
    /// The message is being inspected (delivery trace, deadletter dump)
    /// without a handler invocation.
    Inspection,
}

/// Who is invoking the hook: the subscriber pipeline itself, or an outer
/// envelope unwrapping an inner one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invoker {
    Pipeline,
    OuterEnvelope,
}

/// A type-erased message payload plus its routing metadata.
///
/// `payload` is `Box<dyn Any + Send>` rather than a generic parameter because
/// the mailbox fabric stores heterogeneous messages in one queue and
/// dispatches by `TypeId` lookup at the subscriber, not at the sender.
pub struct Message {
    type_id: TypeId,
    type_name: &'static str,
    kind: MessageKind,
    mutability: Mutability,
    payload: Box<dyn Any + Send>,
    /// Base types a subscriber may bind to instead of the concrete type,
    /// most-derived-first. Populated by `.with_upcast_chain` — empty by
    /// default, since most messages have no base type a subscriber would
    /// reasonably want to bind against.
    upcast_chain: Vec<TypeId>,
}

impl Message {
    /// Wrap a concrete payload as a classical message.
    pub fn classical<T: Any + Send + 'static>(payload: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            kind: MessageKind::Classical,
            mutability: Mutability::Immutable,
            payload: Box::new(payload),
            upcast_chain: Vec::new(),
        }
    }

    /// Declare the chain of base types this message's handler-finder should
    /// also try, in order, if no subscriber is bound to the concrete type.
    /// Mirrors the original's upcaster chain (design note §9): a per-type
    /// function returning the next base type id. Here the chain is
    /// precomputed once at construction rather than walked lazily, since
    /// the set of base types for a given concrete type is static.
    pub fn with_upcast_chain(mut self, bases: Vec<TypeId>) -> Self {
        self.upcast_chain = bases;
        self
    }

    /// The base types a subscriber may also bind to, most-derived-first.
    pub fn upcast_chain(&self) -> &[TypeId] {
        &self.upcast_chain
    }

    /// Wrap a concrete payload as a mutable classical message.
    pub fn mutable<T: Any + Send + 'static>(payload: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            kind: MessageKind::Classical,
            mutability: Mutability::Mutable,
            payload: Box::new(payload),
            upcast_chain: Vec::new(),
        }
    }

    /// Wrap a zero-sized signal type.
    pub fn signal<T: Any + Send + Default + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            kind: MessageKind::Signal,
            mutability: Mutability::Immutable,
            payload: Box::new(T::default()),
            upcast_chain: Vec::new(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    /// Downcast the payload by shared reference.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    /// Downcast the payload by exclusive reference. Callers are responsible
    /// for checking `mutability()` first — this method itself does not
    /// enforce the immutable-handler contract, since that check belongs to
    /// the dispatch layer which knows the handler's declared signature.
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut()
    }

    /// Consume the envelope, returning the boxed payload if the type matches.
    pub fn downcast<T: Any>(self) -> Result<Box<T>, Box<dyn Any + Send>> {
        self.payload.downcast()
    }

    /// Wrap `inner` behind a user `Envelope`, producing a message whose
    /// routing metadata (type id, type name, mutability, upcast chain) still
    /// describes `inner` — a subscriber binds to the wrapped message's
    /// concrete type exactly as if no envelope were present, while the
    /// handler-finder unwraps one envelope layer at a time via
    /// `into_envelope_parts`.
    pub fn enveloped(envelope: Box<dyn Envelope>, inner: Message) -> Self {
        let kind = envelope.kind_hint();
        Self {
            type_id: inner.type_id,
            type_name: inner.type_name,
            kind,
            mutability: inner.mutability,
            upcast_chain: inner.upcast_chain.clone(),
            payload: Box::new(EnvelopeBox { envelope, inner }),
        }
    }

    /// Peek at the innermost payload without consuming the message, peeling
    /// envelope layers one at a time via `access_hook(HookContext::Inspection, ...)`.
    /// Returns `None` if any layer declines to call through `proceed` — its
    /// payload is hidden from inspection the same way it would be hidden
    /// from a handler, so callers that gate on this (delivery filters,
    /// deadletter dumps) must treat a refusing envelope as "does not match"
    /// rather than panicking or guessing at the hidden payload.
    pub fn inspect<R>(&self, f: impl FnOnce(&Message) -> R) -> Option<R> {
        match self.payload.downcast_ref::<EnvelopeBox>() {
            Some(EnvelopeBox { envelope, inner }) => {
                let f_cell = std::cell::RefCell::new(Some(f));
                let out_cell = std::cell::RefCell::new(None);
                envelope.access_hook(HookContext::Inspection, Invoker::Pipeline, &mut || {
                    if let Some(f) = f_cell.borrow_mut().take() {
                        *out_cell.borrow_mut() = inner.inspect(f);
                    }
                });
                out_cell.into_inner()
            }
            None => Some(f(self)),
        }
    }

    /// Unwrap one envelope layer. Returns the envelope and the message it
    /// wrapped if this message was built with `enveloped`; otherwise returns
    /// `self` unchanged in the `Err` arm, reconstructed from its own payload
    /// box so no routing metadata is lost.
    pub fn into_envelope_parts(self) -> Result<(Box<dyn Envelope>, Message), Message> {
        let Message {
            type_id,
            type_name,
            kind,
            mutability,
            payload,
            upcast_chain,
        } = self;
        match payload.downcast::<EnvelopeBox>() {
            Ok(boxed) => {
                let EnvelopeBox { envelope, inner } = *boxed;
                Ok((envelope, inner))
            }
            Err(payload) => Err(Message {
                type_id,
                type_name,
                kind,
                mutability,
                payload,
                upcast_chain,
            }),
        }
    }
}

/// Internal payload kind used by `Message::enveloped` to bundle an envelope
/// trait object together with the message it wraps.
struct EnvelopeBox {
    envelope: Box<dyn Envelope>,
    inner: Message,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type_name", &self.type_name)
            .field("kind", &self.kind)
            .field("mutability", &self.mutability)
            .finish()
    }
}

/// An open-ended envelope wrapping a `Message` (or another `Envelope`),
/// invoked at dispatch, transformation, and inspection call sites.
///
/// Concrete envelope types (user-defined wrappers, the built-in
/// `ServiceRequestEnvelope`) implement this trait; the agent runtime only
/// ever talks to the trait object.
pub trait Envelope: Send {
    /// Called before the wrapped message reaches its handler, is
    /// transformed, or is merely inspected. Implementations may run
    /// arbitrary logic (e.g. start a timing span) and must call through to
    /// `proceed` to continue the pipeline, or return without calling it to
    /// suppress delivery.
    fn access_hook(&self, context: HookContext, invoker: Invoker, proceed: &mut dyn FnMut());

    /// The kind hint used by the message-limit pipeline to special-case
    /// service requests.
    fn kind_hint(&self) -> MessageKind {
        MessageKind::Enveloped
    }
}

/// A oneshot completion slot wrapping a synchronous service-request call,
/// used to avoid deadlock when a handler blocks waiting on its own reply.
///
/// `transform` overflow actions are rejected against this envelope kind —
/// the message-limit pipeline checks `kind_hint()` and returns
/// `RcError::SvcRequestCannotBeTransformedOnOverlimit` rather than invoking
/// the configured transform.
pub struct ServiceRequestEnvelope<R: Send + 'static> {
    reply_to: crossbeam_channel::Sender<R>,
}

impl<R: Send + 'static> ServiceRequestEnvelope<R> {
    pub fn new(reply_to: crossbeam_channel::Sender<R>) -> Self {
        Self { reply_to }
    }

    /// Deliver the result to the waiting caller. Dropping the envelope
    /// without calling this leaves the caller blocked until its own
    /// recv_timeout (if any) fires — mirrors the original's "the caller owns
    /// the timeout" contract.
    pub fn complete(&self, result: R) -> Result<(), crossbeam_channel::SendError<R>> {
        self.reply_to.send(result)
    }
}

impl<R: Send + 'static> Envelope for ServiceRequestEnvelope<R> {
    fn access_hook(&self, _context: HookContext, _invoker: Invoker, proceed: &mut dyn FnMut()) {
        proceed()
    }

    fn kind_hint(&self) -> MessageKind {
        MessageKind::ServiceRequest
    }
}
