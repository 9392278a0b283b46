//! Payloads and a recording event target shared by the integration tests.
#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use evbridge_core::{
    traits::{EventTarget, Listener, Payload},
    LocalTarget,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Tick(u32),
    Failure(&'static str),
    Stop,
}

impl Payload for Msg {
    fn into_error(self) -> Box<dyn std::error::Error> {
        match self {
            Msg::Failure(reason) => reason.into(),
            other => format!("unexpected payload {other:?}").into(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Tick(pub u32);

#[derive(Debug, thiserror::Error)]
#[error("not a tick: {0:?}")]
pub struct NotATick(Msg);

impl TryFrom<Msg> for Tick {
    type Error = NotATick;

    fn try_from(msg: Msg) -> Result<Self, Self::Error> {
        match msg {
            Msg::Tick(n) => Ok(Tick(n)),
            other => Err(NotATick(other)),
        }
    }
}

/// A [`LocalTarget`] that remembers every registration and removal.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    target:  LocalTarget<Msg>,
    added:   Rc<RefCell<Vec<String>>>,
    removed: Rc<RefCell<Vec<String>>>,
}

impl Recording {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        Default::default()
    }

    pub fn dispatch(&self, event: &str, payload: Msg) -> usize {
        self.target.dispatch(event, &payload)
    }

    pub fn added(&self) -> Vec<String> {
        self.added.borrow().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.borrow().clone()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.target.listener_count(event)
    }
}

impl EventTarget for Recording {
    type ListenerId = <LocalTarget<Msg> as EventTarget>::ListenerId;
    type Payload = Msg;

    fn add_listener(&self, event: &str, listener: Listener<Msg>) -> Self::ListenerId {
        self.added.borrow_mut().push(event.to_owned());
        self.target.add_listener(event, listener)
    }

    fn remove_listener(&self, event: &str, id: Self::ListenerId) {
        self.removed.borrow_mut().push(event.to_owned());
        self.target.remove_listener(event, id)
    }
}

/// An event target that calls every listener registered when a dispatch
/// starts, including ones removed by an earlier listener of the same
/// dispatch.
#[derive(Clone, Default)]
pub struct Snapshot {
    listeners: Rc<RefCell<Vec<(usize, String, Listener<Msg>)>>>,
    next_id:   Rc<Cell<usize>>,
}

impl Snapshot {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        Default::default()
    }

    /// Returns the number of listeners called.
    pub fn dispatch(&self, event: &str, payload: Msg) -> usize {
        let snapshot: Vec<_> = self
            .listeners
            .borrow()
            .iter()
            .filter(|(_, name, _)| name == event)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in &snapshot {
            listener(&payload);
        }
        snapshot.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|(_, name, _)| name == event)
            .count()
    }
}

impl EventTarget for Snapshot {
    type ListenerId = usize;
    type Payload = Msg;

    fn add_listener(&self, event: &str, listener: Listener<Msg>) -> usize {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.listeners
            .borrow_mut()
            .push((id, event.to_owned(), listener));
        id
    }

    fn remove_listener(&self, _event: &str, id: usize) {
        self.listeners.borrow_mut().retain(|(other, ..)| *other != id);
    }
}
