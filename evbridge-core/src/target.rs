//! An in-process event target.

use std::{cell::RefCell, fmt, rc::Rc};

use derive_where::derive_where;
use dlv_list::{Index, VecList};
use evbridge_traits::{EventTarget, Listener, Payload};
use hashbrown::HashMap;

/// Handle to a listener registered on a [`LocalTarget`].
#[derive_where(Debug, Clone, Copy)]
pub struct LocalListenerId<P>(Index<Listener<P>>);

/// A single-threaded event target.
///
/// Listeners are grouped by event name and called in the order they were
/// registered. Clones share the same listener table.
#[derive_where(Clone, Default)]
pub struct LocalTarget<P> {
    listeners: Rc<RefCell<HashMap<String, VecList<Listener<P>>>>>,
}

impl<P> fmt::Debug for LocalTarget<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.borrow();
        f.debug_map()
            .entries(listeners.iter().map(|(name, list)| (name, list.len())))
            .finish()
    }
}

impl<P> LocalTarget<P> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of listeners currently registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.borrow().get(event).map_or(0, VecList::len)
    }

    /// Call every listener registered for `event` with `payload`.
    ///
    /// The set of listeners is fixed when dispatch starts: listeners added by
    /// a listener are not called for this payload, listeners removed by a
    /// listener are skipped if they haven't run yet. Returns the number of
    /// listeners called.
    pub fn dispatch(&self, event: &str, payload: &P) -> usize {
        let snapshot: Vec<_> = {
            let listeners = self.listeners.borrow();
            let Some(list) = listeners.get(event) else {
                tracing::trace!(event, "no listener");
                return 0
            };
            let mut snapshot = Vec::with_capacity(list.len());
            let mut cursor = list.front_index();
            while let Some(index) = cursor {
                if let Some(listener) = list.get(index) {
                    snapshot.push((index, listener.clone()));
                }
                cursor = list.get_next_index(index);
            }
            snapshot
        };
        let mut called = 0;
        for (index, listener) in snapshot {
            let still_registered = self
                .listeners
                .borrow()
                .get(event)
                .map_or(false, |list| list.get(index).is_some());
            if !still_registered {
                continue
            }
            listener(payload);
            called += 1;
        }
        tracing::trace!(event, called, "dispatched");
        called
    }
}

impl<P: Payload> EventTarget for LocalTarget<P> {
    type ListenerId = LocalListenerId<P>;
    type Payload = P;

    fn add_listener(&self, event: &str, listener: Listener<P>) -> Self::ListenerId {
        let mut listeners = self.listeners.borrow_mut();
        let list = listeners.entry_ref(event).or_insert_with(VecList::new);
        LocalListenerId(list.push_back(listener))
    }

    fn remove_listener(&self, event: &str, id: Self::ListenerId) {
        let mut listeners = self.listeners.borrow_mut();
        let Some(list) = listeners.get_mut(event) else {
            return
        };
        list.remove(id.0);
        if list.is_empty() {
            listeners.remove(event);
        }
    }
}
