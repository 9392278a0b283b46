//! Turning events dispatched on an [`EventTarget`] into a [`PullSequence`].
//!
//! Events dispatched before anyone asks for them are buffered, and pulls made
//! before any event arrives are queued. At any time at most one of the two
//! queues is non-empty, and they are matched in FIFO order.
//!
//! A bridge finishes the first time any of these happen:
//!
//!   - the consumer calls [`Bridge::close`],
//!   - the target dispatches on the `"error"` channel,
//!   - the configured terminate event is dispatched,
//!   - the abort signal fires.
//!
//! Finishing releases every listener the bridge registered. Pulls made after
//! that resolve to `Ok(None)`, except that a failure which nobody was waiting
//! for is kept and handed to exactly one later pull.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{ready, Context, Poll},
};

use derive_where::derive_where;
use evbridge_traits::{EventTarget, Listener, Payload, PullSequence, ERROR_EVENT};
use futures_core::{FusedStream, Stream};

use crate::{
    error::SharedError,
    next::{Next, Outcome, Request},
    signal::{AbortListenerId, AbortSignal},
    Error,
};

/// Options for [`Bridge::new`].
#[derive(Debug, Default, Clone)]
pub struct Options {
    /// Fail the bridge with [`Error::Aborted`] when this signal fires.
    pub signal:                Option<AbortSignal>,
    /// End the sequence, without an error, when this event is dispatched.
    /// Ignored if it is the same as the primary event name.
    pub terminate_event:       Option<String>,
    /// Whether [`Bridge::throw`] also closes the bridge.
    ///
    /// By default `throw` only stops listening to the primary event and the
    /// error channel. Pending pulls stay pending until the bridge is closed,
    /// aborted or terminated.
    pub throw_flushes_pending: bool,
}

impl Options {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_terminate_event(mut self, event: impl Into<String>) -> Self {
        self.terminate_event = Some(event.into());
        self
    }

    pub fn with_throw_flushes_pending(mut self, flush: bool) -> Self {
        self.throw_flushes_pending = flush;
        self
    }
}

#[derive(Debug)]
struct State<E> {
    events:   VecDeque<E>,
    requests: VecDeque<Rc<Request<E>>>,
    error:    Option<Error>,
    finished: bool,
}

impl<E> State<E> {
    /// Take the oldest request that still has a [`Next`] waiting on it.
    /// Requests whose future has been dropped are discarded.
    fn pop_request(&mut self) -> Option<Rc<Request<E>>> {
        while let Some(request) = self.requests.pop_front() {
            if Rc::strong_count(&request) > 1 {
                return Some(request)
            }
        }
        None
    }
}

#[derive(Debug)]
#[derive_where(Default)]
struct Subscriptions<Id> {
    event:     Option<Id>,
    error:     Option<Id>,
    terminate: Option<Id>,
    abort:     Option<AbortListenerId>,
}

impl<Id> Subscriptions<Id> {
    fn is_empty(&self) -> bool {
        self.event.is_none() &&
            self.error.is_none() &&
            self.terminate.is_none() &&
            self.abort.is_none()
    }
}

struct Inner<T: EventTarget, E> {
    target:                T,
    event:                 Rc<str>,
    terminate_event:       Option<String>,
    signal:                Option<AbortSignal>,
    throw_flushes_pending: bool,
    state:                 RefCell<State<E>>,
    subscriptions:         RefCell<Subscriptions<T::ListenerId>>,
}

impl<T: EventTarget, E> Inner<T, E> {
    fn pull(&self) -> Next<E> {
        let mut state = self.state.borrow_mut();
        if let Some(event) = state.events.pop_front() {
            return Next::ready(Ok(Some(event)))
        }
        // Only the first pull after a failure sees it.
        if let Some(error) = state.error.take() {
            return Next::ready(Err(error))
        }
        if state.finished {
            return Next::done()
        }
        let request = Rc::new(Request::new());
        state.requests.push_back(request.clone());
        Next::waiting(request)
    }

    /// Unregister the given listeners from the target and the signal.
    fn release(&self, subscriptions: Subscriptions<T::ListenerId>) {
        let Subscriptions {
            event,
            error,
            terminate,
            abort,
        } = subscriptions;
        if let Some(id) = event {
            self.target.remove_listener(&self.event, id);
        }
        if let Some(id) = error {
            self.target.remove_listener(ERROR_EVENT, id);
        }
        if let (Some(id), Some(name)) = (terminate, self.terminate_event.as_deref()) {
            self.target.remove_listener(name, id);
        }
        if let (Some(id), Some(signal)) = (abort, self.signal.as_ref()) {
            signal.remove_listener(id);
        }
    }

    /// Release every subscription still held, mark the bridge finished, and
    /// resolve every pending pull to `Ok(None)`.
    fn teardown(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        if !subscriptions.is_empty() {
            tracing::debug!(event = %self.event, "tearing down event bridge");
            self.release(subscriptions);
        }
        let requests = {
            let mut state = self.state.borrow_mut();
            state.finished = true;
            std::mem::take(&mut state.requests)
        };
        if !requests.is_empty() {
            tracing::trace!(event = %self.event, pending = requests.len(), "flushing pending pulls");
        }
        for request in requests {
            request.settle(Ok(None));
        }
    }

    fn fail(&self, error: Error) {
        let request = {
            let mut state = self.state.borrow_mut();
            if state.finished {
                tracing::trace!(event = %self.event, %error, "failure after finish, ignored");
                return
            }
            tracing::debug!(event = %self.event, %error, "event bridge failed");
            state.finished = true;
            match state.pop_request() {
                Some(request) => Some((request, error)),
                None => {
                    // Keep it for the next pull.
                    state.error = Some(error);
                    None
                },
            }
        };
        if let Some((request, error)) = request {
            request.settle(Err(error));
        }
        self.teardown();
    }

    fn throw(&self, error: Error) -> Next<E> {
        tracing::debug!(event = %self.event, %error, "error thrown into event bridge");
        self.state.borrow_mut().error = Some(error.clone());
        let released = {
            let mut subscriptions = self.subscriptions.borrow_mut();
            Subscriptions {
                event: subscriptions.event.take(),
                error: subscriptions.error.take(),
                ..Default::default()
            }
        };
        self.release(released);
        if self.throw_flushes_pending {
            self.teardown();
        }
        Next::ready(Err(error))
    }
}

impl<T, E> Inner<T, E>
where
    T: EventTarget,
    E: TryFrom<T::Payload>,
    E::Error: std::error::Error + 'static,
{
    fn on_event(&self, payload: &T::Payload) {
        if self.state.borrow().finished {
            tracing::trace!(event = %self.event, "event after finish, ignored");
            return
        }
        let event = match E::try_from(payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                return self.fail(Error::Decode {
                    event:  self.event.clone(),
                    source: SharedError::new(e),
                })
            },
        };
        let request = {
            let mut state = self.state.borrow_mut();
            match state.pop_request() {
                Some(request) => Some((request, event)),
                None => {
                    state.events.push_back(event);
                    None
                },
            }
        };
        if let Some((request, event)) = request {
            request.settle(Ok(Some(event)));
        }
    }
}

impl<T: EventTarget, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Build a target listener that forwards to `f` for as long as the bridge is
/// alive.
fn handler<T, E>(
    inner: &Rc<Inner<T, E>>,
    f: impl Fn(&Inner<T, E>, &T::Payload) + 'static,
) -> Listener<T::Payload>
where
    T: EventTarget + 'static,
    E: 'static,
{
    let weak: Weak<Inner<T, E>> = Rc::downgrade(inner);
    Rc::new(move |payload: &T::Payload| {
        if let Some(inner) = weak.upgrade() {
            f(&inner, payload);
        }
    })
}

/// A pull-based sequence of the events dispatched under one name on an
/// [`EventTarget`].
///
/// Payloads are decoded into `E` with [`TryFrom`]. A payload that fails to
/// decode ends the sequence with [`Error::Decode`].
///
/// Besides [`next`](Self::next), the bridge is also a [`Stream`] of
/// `Result<E, Error>`, which ends when the sequence is done.
pub struct Bridge<T: EventTarget, E> {
    inner:      Rc<Inner<T, E>>,
    /// Pull in flight on behalf of the `Stream` impl.
    polling:    Option<Next<E>>,
    terminated: bool,
}

impl<T: EventTarget, E> fmt::Debug for Bridge<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Bridge")
            .field("event", &self.inner.event)
            .field("terminate_event", &self.inner.terminate_event)
            .field("buffered", &state.events.len())
            .field("pending", &state.requests.len())
            .field("finished", &state.finished)
            .finish()
    }
}

impl<T, E> Bridge<T, E>
where
    T: EventTarget + 'static,
    E: TryFrom<T::Payload> + 'static,
    E::Error: std::error::Error + 'static,
{
    /// Start listening for `event` on `target`.
    ///
    /// Besides `event`, the bridge listens to the `"error"` channel (unless
    /// `event` is `"error"` itself), the terminate event and the abort
    /// signal, if given in `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the signal has already fired, and
    /// [`Error::EmptyEventName`] if `event` is empty. No listener is
    /// registered in either case.
    pub fn new(target: T, event: impl Into<String>, options: Options) -> Result<Self, Error> {
        let Options {
            signal,
            terminate_event,
            throw_flushes_pending,
        } = options;
        if signal.as_ref().is_some_and(AbortSignal::is_aborted) {
            return Err(Error::Aborted)
        }
        let event: String = event.into();
        if event.is_empty() {
            return Err(Error::EmptyEventName)
        }
        let terminate_event = terminate_event.filter(|name| *name != event);

        let inner = Rc::new(Inner {
            target,
            event: event.into(),
            terminate_event,
            signal,
            throw_flushes_pending,
            state: RefCell::new(State {
                events:   VecDeque::new(),
                requests: VecDeque::new(),
                error:    None,
                finished: false,
            }),
            subscriptions: RefCell::new(Subscriptions::default()),
        });

        let mut subscriptions = Subscriptions::default();
        subscriptions.event = Some(
            inner
                .target
                .add_listener(&inner.event, handler(&inner, Inner::on_event)),
        );
        if &*inner.event != ERROR_EVENT {
            let listener = handler(&inner, |inner, payload| {
                inner.fail(Error::Source(payload.clone().into_error().into()))
            });
            subscriptions.error = Some(inner.target.add_listener(ERROR_EVENT, listener));
        }
        if let Some(name) = inner.terminate_event.as_deref() {
            let listener = handler(&inner, |inner, _| inner.teardown());
            subscriptions.terminate = Some(inner.target.add_listener(name, listener));
        }
        if let Some(signal) = inner.signal.as_ref() {
            let weak = Rc::downgrade(&inner);
            subscriptions.abort = signal.add_listener(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fail(Error::Aborted);
                }
            });
        }
        tracing::debug!(
            event = %inner.event,
            terminate_event = ?inner.terminate_event,
            abortable = subscriptions.abort.is_some(),
            "event bridge subscribed"
        );
        *inner.subscriptions.borrow_mut() = subscriptions;

        Ok(Self {
            inner,
            polling: None,
            terminated: false,
        })
    }
}

impl<T: EventTarget, E> Bridge<T, E> {
    /// Request the next event.
    ///
    /// The request is queued when this is called, not when the returned
    /// future is first polled, so calling `next` several times in a row
    /// reserves the following events in order.
    pub fn next(&self) -> Next<E> {
        self.inner.pull()
    }

    /// Stop listening and end the sequence. Every pending pull resolves to
    /// `Ok(None)`. Calling this more than once is fine.
    pub fn close(&self) -> Next<E> {
        self.inner.teardown();
        Next::done()
    }

    /// Inject `error` into the sequence.
    ///
    /// The error is stored for the next pull, the bridge stops listening to
    /// the primary event and the error channel, and the returned future fails
    /// with `error`. Unless [`Options::throw_flushes_pending`] is set, pulls
    /// that are already pending are left alone, and the terminate event and
    /// abort signal are still listened to.
    pub fn throw(&self, error: Error) -> Next<E> {
        self.inner.throw(error)
    }

    /// Whether the sequence has ended.
    pub fn is_finished(&self) -> bool {
        self.inner.state.borrow().finished
    }

    /// Name of the event this bridge listens to.
    pub fn event(&self) -> &str {
        &self.inner.event
    }
}

impl<T: EventTarget, E> PullSequence for Bridge<T, E> {
    type Error = Error;
    type Item = E;
    type Next = Next<E>;

    fn next(&self) -> Self::Next {
        Bridge::next(self)
    }

    fn close(&self) -> Self::Next {
        Bridge::close(self)
    }

    fn throw(&self, error: Self::Error) -> Self::Next {
        Bridge::throw(self, error)
    }
}

impl<T: EventTarget, E> Stream for Bridge<T, E> {
    type Item = Result<E, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None)
        }
        let inner = &this.inner;
        let next = this.polling.get_or_insert_with(|| inner.pull());
        let outcome: Outcome<E> = ready!(Pin::new(next).poll(cx));
        this.polling = None;
        Poll::Ready(match outcome {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                this.terminated = true;
                None
            },
            Err(e) => Some(Err(e)),
        })
    }
}

impl<T: EventTarget, E> FusedStream for Bridge<T, E> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Shorthand for [`Bridge::new`].
pub fn bridge<T, E>(target: T, event: impl Into<String>, options: Options) -> Result<Bridge<T, E>, Error>
where
    T: EventTarget + 'static,
    E: TryFrom<T::Payload> + 'static,
    E::Error: std::error::Error + 'static,
{
    Bridge::new(target, event, options)
}

#[cfg(test)]
mod test {
    use std::task::{Context, Poll};

    use evbridge_traits::Payload;
    use futures_test::task::new_count_waker;
    use futures_util::{FutureExt, StreamExt};

    use super::{Bridge, Options};
    use crate::{AbortController, Error, LocalTarget};

    #[derive(Debug, Clone, PartialEq)]
    enum Msg {
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
    struct Tick(u32);

    #[derive(Debug, thiserror::Error)]
    #[error("not a tick: {0:?}")]
    struct NotATick(Msg);

    impl TryFrom<Msg> for Tick {
        type Error = NotATick;

        fn try_from(msg: Msg) -> Result<Self, Self::Error> {
            match msg {
                Msg::Tick(n) => Ok(Tick(n)),
                other => Err(NotATick(other)),
            }
        }
    }

    fn ticks(target: &LocalTarget<Msg>, options: Options) -> Bridge<LocalTarget<Msg>, Tick> {
        let _ = tracing_subscriber::fmt::try_init();
        Bridge::new(target.clone(), "tick", options).unwrap()
    }

    fn total_listeners(target: &LocalTarget<Msg>) -> usize {
        ["tick", "error", "stop"]
            .iter()
            .map(|name| target.listener_count(name))
            .sum()
    }

    #[test]
    fn dropped_pull_does_not_swallow_event() {
        let target = LocalTarget::new();
        let ticks = ticks(&target, Options::new());
        let abandoned = ticks.next();
        let mut kept = ticks.next();
        drop(abandoned);

        target.dispatch("tick", &Msg::Tick(1));
        target.dispatch("tick", &Msg::Tick(2));
        assert_eq!((&mut kept).now_or_never().unwrap().unwrap(), Some(Tick(1)));
        assert_eq!(ticks.next().now_or_never().unwrap().unwrap(), Some(Tick(2)));
    }

    #[test]
    fn dropped_pull_does_not_swallow_error() {
        let target = LocalTarget::new();
        let ticks = ticks(&target, Options::new());
        drop(ticks.next());

        target.dispatch("error", &Msg::Failure("boom"));
        assert!(matches!(
            ticks.next().now_or_never().unwrap(),
            Err(Error::Source(_))
        ));
        assert_eq!(ticks.next().now_or_never().unwrap().unwrap(), None);
    }

    #[test]
    fn settling_wakes_the_consumer() {
        let target = LocalTarget::new();
        let ticks = ticks(&target, Options::new());
        let (waker, count) = new_count_waker();
        let mut cx = Context::from_waker(&waker);
        let mut pending = ticks.next();
        assert!(pending.poll_unpin(&mut cx).is_pending());
        assert_eq!(count.get(), 0);

        target.dispatch("tick", &Msg::Tick(7));
        assert_eq!(count.get(), 1);
        assert!(matches!(pending.poll_unpin(&mut cx), Poll::Ready(Ok(Some(Tick(7))))));
    }

    #[test]
    fn dropping_bridge_releases_listeners() {
        let target = LocalTarget::new();
        let controller = AbortController::new();
        let ticks = ticks(
            &target,
            Options::new()
                .with_terminate_event("stop")
                .with_signal(controller.signal()),
        );
        assert_eq!(total_listeners(&target), 3);
        assert_eq!(controller.signal().listener_count(), 1);

        let pending = ticks.next();
        drop(ticks);
        assert_eq!(total_listeners(&target), 0);
        assert_eq!(controller.signal().listener_count(), 0);
        assert_eq!(pending.now_or_never().unwrap().unwrap(), None);
    }

    #[test]
    fn undecodable_payload_ends_sequence() {
        let target = LocalTarget::new();
        let ticks = ticks(&target, Options::new());
        target.dispatch("tick", &Msg::Tick(1));
        target.dispatch("tick", &Msg::Stop);

        assert_eq!(ticks.next().now_or_never().unwrap().unwrap(), Some(Tick(1)));
        match ticks.next().now_or_never().unwrap() {
            Err(Error::Decode { event, source }) => {
                assert_eq!(&*event, "tick");
                assert_eq!(source.to_string(), "not a tick: Stop");
            },
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(ticks.next().now_or_never().unwrap().unwrap(), None);
        assert_eq!(total_listeners(&target), 0);
    }

    #[test]
    fn error_as_primary_event() {
        let target = LocalTarget::<Msg>::new();
        let errors: Bridge<_, Msg> = Bridge::new(target.clone(), "error", Options::new()).unwrap();
        assert_eq!(target.listener_count("error"), 1);

        target.dispatch("error", &Msg::Failure("boom"));
        assert_eq!(
            errors.next().now_or_never().unwrap().unwrap(),
            Some(Msg::Failure("boom"))
        );
        assert!(!errors.is_finished());
    }

    #[test]
    fn terminate_event_same_as_primary_is_ignored() {
        let target = LocalTarget::new();
        let ticks = ticks(&target, Options::new().with_terminate_event("tick"));
        assert_eq!(target.listener_count("tick"), 1);

        target.dispatch("tick", &Msg::Tick(3));
        assert_eq!(ticks.next().now_or_never().unwrap().unwrap(), Some(Tick(3)));
        assert!(!ticks.is_finished());
    }

    #[test]
    fn empty_event_name() {
        let target = LocalTarget::<Msg>::new();
        let err = Bridge::<_, Tick>::new(target.clone(), "", Options::new()).unwrap_err();
        assert!(matches!(err, Error::EmptyEventName));
        assert_eq!(total_listeners(&target), 0);
    }

    #[test]
    fn throw_keeps_pending_pulls_by_default() {
        let target = LocalTarget::new();
        let ticks = ticks(&target, Options::new().with_terminate_event("stop"));
        let mut pending = ticks.next();

        let thrown = ticks.throw(Error::injected(std::fmt::Error));
        assert!(matches!(thrown.now_or_never().unwrap(), Err(Error::Injected(_))));
        assert!((&mut pending).now_or_never().is_none());
        assert!(!ticks.is_finished());
        assert_eq!(target.listener_count("tick"), 0);
        assert_eq!(target.listener_count("error"), 0);
        assert_eq!(target.listener_count("stop"), 1);

        // The thrown error is handed out once more...
        assert!(matches!(
            ticks.next().now_or_never().unwrap(),
            Err(Error::Injected(_))
        ));
        // ...after which pulls wait again, until the bridge terminates.
        let mut another = ticks.next();
        assert!((&mut another).now_or_never().is_none());
        target.dispatch("stop", &Msg::Stop);
        assert_eq!(pending.now_or_never().unwrap().unwrap(), None);
        assert_eq!(another.now_or_never().unwrap().unwrap(), None);
        assert!(ticks.is_finished());
        assert_eq!(total_listeners(&target), 0);
    }

    #[test]
    fn throw_flushes_pending_when_configured() {
        let target = LocalTarget::new();
        let ticks = ticks(
            &target,
            Options::new()
                .with_terminate_event("stop")
                .with_throw_flushes_pending(true),
        );
        let pending = ticks.next();

        let thrown = ticks.throw(Error::injected(std::fmt::Error));
        assert!(matches!(thrown.now_or_never().unwrap(), Err(Error::Injected(_))));
        assert_eq!(pending.now_or_never().unwrap().unwrap(), None);
        assert!(ticks.is_finished());
        assert_eq!(total_listeners(&target), 0);

        assert!(matches!(
            ticks.next().now_or_never().unwrap(),
            Err(Error::Injected(_))
        ));
        assert_eq!(ticks.next().now_or_never().unwrap().unwrap(), None);
    }

    #[test]
    fn stream_yields_error_then_ends() {
        let target = LocalTarget::new();
        let mut ticks = ticks(&target, Options::new());
        target.dispatch("tick", &Msg::Tick(0));
        target.dispatch("tick", &Msg::Tick(1));
        target.dispatch("error", &Msg::Failure("boom"));

        let items = futures_executor::block_on(StreamExt::collect::<Vec<_>>(&mut ticks));
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], Ok(Tick(0))));
        assert!(matches!(items[1], Ok(Tick(1))));
        assert!(matches!(&items[2], Err(Error::Source(e)) if e.to_string() == "boom"));
        assert!(futures_core::FusedStream::is_terminated(&ticks));
    }
}
