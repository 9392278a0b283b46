//! Traits at the boundary between push-based event targets and pull-based
//! consumers.
//!
//! An [`EventTarget`] is anything that lets you register a [`Listener`] under
//! an event name, and later unregister it. Registration and removal are
//! assumed to be synchronous, and dispatch is assumed to happen on the same
//! thread that owns the target.
//!
//! A [`PullSequence`] is the other side: a consumer asks for the next value
//! and gets a future back.
use std::{future::Future, rc::Rc};

/// Name of the channel on which event targets report failures.
pub const ERROR_EVENT: &str = "error";

/// A callback registered on an event target.
///
/// Listeners receive the payload by reference, since the same payload is
/// handed to every listener registered under the event name.
pub type Listener<P> = Rc<dyn Fn(&P)>;

/// Values dispatched by an event target.
pub trait Payload: Clone + 'static {
    /// Interpret this payload as a failure. Called for payloads dispatched on
    /// the [`ERROR_EVENT`] channel.
    fn into_error(self) -> Box<dyn std::error::Error>;
}

impl Payload for String {
    fn into_error(self) -> Box<dyn std::error::Error> {
        self.into()
    }
}

impl Payload for &'static str {
    fn into_error(self) -> Box<dyn std::error::Error> {
        self.into()
    }
}

/// Something listeners can be attached to by event name.
pub trait EventTarget {
    /// Type of values dispatched to listeners.
    type Payload: Payload;
    /// Handle identifying a registered listener.
    type ListenerId: Clone + std::fmt::Debug;

    /// Register `listener` to be called whenever `event` is dispatched.
    fn add_listener(&self, event: &str, listener: Listener<Self::Payload>) -> Self::ListenerId;

    /// Unregister a listener previously returned by
    /// [`add_listener`](Self::add_listener). Removing a listener that is no
    /// longer registered is a no-op.
    fn remove_listener(&self, event: &str, id: Self::ListenerId);
}

impl<T: EventTarget + ?Sized> EventTarget for &T {
    type ListenerId = T::ListenerId;
    type Payload = T::Payload;

    #[inline]
    fn add_listener(&self, event: &str, listener: Listener<Self::Payload>) -> Self::ListenerId {
        (**self).add_listener(event, listener)
    }

    #[inline]
    fn remove_listener(&self, event: &str, id: Self::ListenerId) {
        (**self).remove_listener(event, id)
    }
}

impl<T: EventTarget + ?Sized> EventTarget for Rc<T> {
    type ListenerId = T::ListenerId;
    type Payload = T::Payload;

    #[inline]
    fn add_listener(&self, event: &str, listener: Listener<Self::Payload>) -> Self::ListenerId {
        (**self).add_listener(event, listener)
    }

    #[inline]
    fn remove_listener(&self, event: &str, id: Self::ListenerId) {
        (**self).remove_listener(event, id)
    }
}

/// A sequence consumed by repeatedly asking for the next value.
///
/// All three operations return the same kind of future. It resolves to
/// `Ok(Some(item))` for a value, `Ok(None)` once the sequence is done, or
/// `Err(error)` for a failure.
pub trait PullSequence {
    /// Type of the values produced.
    type Item;
    /// Type of the failures produced.
    type Error;
    /// Future returned by every operation of this sequence.
    type Next: Future<Output = Result<Option<Self::Item>, Self::Error>>;

    /// Request the next value.
    ///
    /// Calling this several times without awaiting is allowed, each call is
    /// queued and answered in the order it was made.
    fn next(&self) -> Self::Next;

    /// Stop the sequence early. Always resolves to `Ok(None)`, and calling it
    /// more than once is fine.
    fn close(&self) -> Self::Next;

    /// Inject a failure into the sequence. Resolves to `Err(error)`.
    fn throw(&self, error: Self::Error) -> Self::Next;
}
