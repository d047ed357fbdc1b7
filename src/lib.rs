//! Single-threaded, non-blocking socket reactor.
//!
//! One [`EventLoop`] multiplexes listening sockets, client and server
//! connections, and timers. Application code plugs in through the
//! [`Handler`] trait, whose `on_message` decides how much of the buffered
//! input forms complete messages.
//!
//! # Architecture
//!
//! - **EventLoop**: waits on epoll/kqueue, dispatches readiness, fires timers
//! - **Connection**: socket, inbound [`Buffer`], FIFO of outbound buffers, handler
//! - **Server**: listening socket plus an accept hook that creates handlers
//! - **Client**: non-blocking connect with optional keep-alive
//! - **Timers**: one-shot and repeating callbacks, resettable from anywhere
//! - **LoopBuilder**: fluent construction with per-cycle bounds
//!
//! Handles ([`ConnId`], [`TimerId`], [`ServerId`]) are generational, so a
//! handle kept past its object's lifetime never refers to a newer object.

mod buffer;
mod builder;
mod error;
mod handler;
pub mod net;
mod reactor;
mod timer;
mod utils;

pub use buffer::Buffer;
pub use builder::LoopBuilder;
pub use error::{Error, Result};
pub use handler::{Decode, Handler};
pub use net::client::Client;
pub use net::server::{Server, ServerId};
pub use reactor::{ConnId, ConnState, EventLoop};
pub use timer::TimerId;
