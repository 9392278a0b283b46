//! One-shot completion slots, and the future observing them.

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use futures_core::FusedFuture;

use crate::Error;

/// What a pull resolves to: an event, the end of the sequence, or a failure.
pub type Outcome<E> = Result<Option<E>, Error>;

/// A pull waiting to be answered.
#[derive(Debug)]
pub(crate) struct Request<E> {
    outcome: RefCell<Option<Outcome<E>>>,
    waker:   RefCell<Option<Waker>>,
}

impl<E> Request<E> {
    pub(crate) fn new() -> Self {
        Self {
            outcome: RefCell::new(None),
            waker:   RefCell::new(None),
        }
    }

    /// Answer this request and wake up whoever is waiting for it.
    pub(crate) fn settle(&self, outcome: Outcome<E>) {
        let previous = self.outcome.borrow_mut().replace(outcome);
        debug_assert!(previous.is_none(), "request settled twice");
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

#[derive(Debug)]
enum State<E> {
    Ready(Outcome<E>),
    Waiting(Rc<Request<E>>),
    Done,
}

/// Future returned by the operations of a [`Bridge`](crate::Bridge).
///
/// Dropping a `Next` before it completes gives up on the pull: an event that
/// would have gone to it goes to the next pull instead.
#[derive(Debug)]
pub struct Next<E>(State<E>);

// We never hand out pinned references to `E`.
impl<E> Unpin for Next<E> {}

impl<E> Next<E> {
    pub(crate) fn ready(outcome: Outcome<E>) -> Self {
        Self(State::Ready(outcome))
    }

    pub(crate) fn done() -> Self {
        Self::ready(Ok(None))
    }

    pub(crate) fn waiting(request: Rc<Request<E>>) -> Self {
        Self(State::Waiting(request))
    }
}

impl<E> Future for Next<E> {
    type Output = Outcome<E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.0, State::Done) {
            State::Ready(outcome) => Poll::Ready(outcome),
            State::Waiting(request) => {
                if let Some(outcome) = request.outcome.borrow_mut().take() {
                    return Poll::Ready(outcome)
                }
                {
                    let mut waker = request.waker.borrow_mut();
                    if !waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
                        *waker = Some(cx.waker().clone());
                    }
                }
                this.0 = State::Waiting(request);
                Poll::Pending
            },
            State::Done => panic!("`Next` polled after completion"),
        }
    }
}

impl<E> FusedFuture for Next<E> {
    fn is_terminated(&self) -> bool {
        matches!(self.0, State::Done)
    }
}
