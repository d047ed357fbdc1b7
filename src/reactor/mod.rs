//! Event-driven I/O reactor module.
//!
//! - [`core`]: the [`EventLoop`] itself: wait, dispatch, timers, stop
//! - [`io`]: per-connection state machine and buffered non-blocking I/O
//! - [`poller`]: epoll/kqueue wrappers
//! - [`socket`]: non-blocking connect

pub(crate) mod core;
pub(crate) mod io;
pub(crate) mod poller;
pub(crate) mod socket;

pub use self::core::EventLoop;
pub use self::io::{ConnId, ConnState};
