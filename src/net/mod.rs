//! TCP endpoints driven by the [`EventLoop`](crate::EventLoop).
//!
//! - [`client`]: [`Client`] opens outbound connections without blocking
//! - [`server`]: [`Server`] binds a listener and hands accepted sockets to handlers
//! - `utils`: address resolution and raw socket address conversion
//!
//! [`Client`]: client::Client
//! [`Server`]: server::Server

pub mod client;
pub mod server;
pub(crate) mod utils;
