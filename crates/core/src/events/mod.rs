//! # Events
//!
//! Event types and the publish/subscribe bus every other component reports
//! through.

pub mod bus;
pub mod event;

pub use bus::{async_listener, listener, AsyncListener, EventBus, Listener};
pub use event::{Event, EventKind, LogLevel};
