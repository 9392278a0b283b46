use std::{fmt, rc::Rc};

use thiserror::Error;

/// A reference counted error.
///
/// A stored failure may be handed out more than once, for example
/// [`Bridge::throw`](crate::Bridge::throw) both returns the error and keeps it
/// for the next pull, so sources are shared instead of boxed.
#[derive(Clone)]
pub struct SharedError(Rc<dyn std::error::Error>);

impl SharedError {
    pub fn new<E: std::error::Error + 'static>(e: E) -> Self {
        Self(Rc::new(e))
    }
}

impl From<Box<dyn std::error::Error>> for SharedError {
    fn from(e: Box<dyn std::error::Error>) -> Self {
        Self(Rc::from(e))
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Event bridge was aborted via abort signal")]
    Aborted,
    #[error("Event target reported an error: {0}")]
    Source(#[source] SharedError),
    #[error("Payload of event `{event}` could not be decoded: {source}")]
    Decode {
        event:  Rc<str>,
        #[source]
        source: SharedError,
    },
    #[error("Error injected by the consumer: {0}")]
    Injected(#[source] SharedError),
    #[error("Event name must not be empty")]
    EmptyEventName,
}

impl Error {
    /// Wrap an arbitrary error so it can be passed to
    /// [`Bridge::throw`](crate::Bridge::throw).
    pub fn injected<E: std::error::Error + 'static>(e: E) -> Self {
        Self::Injected(SharedError::new(e))
    }

    /// Whether this error was caused by an abort signal.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
