//! Consume events dispatched on an event target as a pull-based sequence.
//!
//! Event targets push: they call every listener registered under an event
//! name. Async code usually wants to pull instead, asking for the next event
//! and awaiting it. A [`Bridge`] sits between the two. It registers listeners
//! on the target, buffers what arrives, and answers pulls in order.
//!
//! ```
//! use evbridge_core::{bridge, LocalTarget, Options};
//! use futures_util::FutureExt;
//!
//! let target = LocalTarget::<String>::new();
//! let events = bridge::<_, String>(target.clone(), "message", Options::new()).unwrap();
//!
//! target.dispatch("message", &"hello".to_owned());
//! let first = events.next().now_or_never().unwrap().unwrap();
//! assert_eq!(first.as_deref(), Some("hello"));
//!
//! // Nothing buffered, so this pull waits...
//! let mut second = events.next();
//! assert!((&mut second).now_or_never().is_none());
//! // ...until the bridge is closed.
//! events.close();
//! assert!(second.now_or_never().unwrap().unwrap().is_none());
//! ```
//!
//! Any type implementing [`EventTarget`](traits::EventTarget) can be bridged,
//! [`LocalTarget`] is a simple in-process one. Cancellation is done with an
//! [`AbortSignal`], obtained from an [`AbortController`].

pub mod bridge;
pub mod error;
pub mod next;
pub mod signal;
pub mod target;

pub use bridge::{bridge, Bridge, Options};
pub use error::Error;
pub use evbridge_traits as traits;
pub use next::Next;
pub use signal::{AbortController, AbortSignal};
pub use target::LocalTarget;
