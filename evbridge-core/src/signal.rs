//! A cancellation token that can only be fired once.
//!
//! An [`AbortController`] owns the right to fire, any number of
//! [`AbortSignal`]s can observe it, either by registering a listener or by
//! awaiting [`AbortSignal::aborted`].

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    rc::Rc,
};

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Identifies a listener registered on an [`AbortSignal`].
    pub struct AbortListenerId;
}

type AbortListener = Box<dyn FnOnce()>;

#[derive(Default)]
struct Inner {
    aborted:      Cell<bool>,
    listeners:    RefCell<SlotMap<AbortListenerId, AbortListener>>,
    event_handle: event_listener::Event,
}

/// The observing half of an abort controller.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Rc<Inner>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.inner.aborted.get())
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}

impl AbortSignal {
    /// Whether the controller of this signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    /// Run `listener` once when the signal fires.
    ///
    /// Returns `None`, and drops the listener without calling it, if the
    /// signal has already fired.
    pub fn add_listener(&self, listener: impl FnOnce() + 'static) -> Option<AbortListenerId> {
        if self.is_aborted() {
            return None
        }
        Some(self.inner.listeners.borrow_mut().insert(Box::new(listener)))
    }

    /// Unregister a listener. Returns whether it was still registered.
    pub fn remove_listener(&self, id: AbortListenerId) -> bool {
        self.inner.listeners.borrow_mut().remove(id).is_some()
    }

    /// Number of listeners waiting for this signal.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Returns a future that completes once the signal has fired.
    pub fn aborted(&self) -> impl Future<Output = ()> + 'static {
        let inner = self.inner.clone();
        async move {
            loop {
                if inner.aborted.get() {
                    return
                }
                let listener = inner.event_handle.listen();
                // Check again, the signal might have fired before the listener was
                // registered.
                if inner.aborted.get() {
                    return
                }
                listener.await;
            }
        }
    }
}

/// The firing half of an abort signal.
#[derive(Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Default::default()
    }

    /// Get a signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal.
    ///
    /// Every registered listener is run once, in no particular order, then
    /// every task awaiting [`AbortSignal::aborted`] is woken up. Calling this
    /// again does nothing.
    pub fn abort(&self) {
        let inner = &self.signal.inner;
        if inner.aborted.replace(true) {
            return
        }
        // Listeners may touch the signal, don't hold the borrow while they run.
        let listeners: Vec<_> = inner
            .listeners
            .borrow_mut()
            .drain()
            .map(|(_, listener)| listener)
            .collect();
        tracing::debug!(listeners = listeners.len(), "abort signal fired");
        for listener in listeners {
            listener();
        }
        inner.event_handle.notify(usize::MAX);
    }
}
