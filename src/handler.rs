//! The framing contract between the loop and application code.

use crate::error::Error;
use crate::reactor::{ConnId, EventLoop};

/// Outcome of one [`Handler::on_message`] invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decode {
    /// `n` bytes form one or more complete messages and were handled. The
    /// loop drops them and offers the remainder again. `Consumed(0)` is
    /// treated as [`Decode::Again`].
    Consumed(usize),
    /// The buffered bytes are an incomplete message. They are kept as is and
    /// the handler is called again once more bytes arrive.
    Again,
    /// Call the handler again on the next loop cycle even if no new bytes
    /// arrive. Nothing is consumed.
    Retry,
    /// The stream is malformed. The connection reports
    /// [`Error::Decode`] and closes.
    Error,
}

/// Per-connection callbacks.
///
/// The value implementing `Handler` is the connection's session state: the
/// client or server side attaches whatever it needs to it at construction.
/// Every callback gets the loop back, so it can send on any connection, arm
/// timers, open clients or stop the loop.
///
/// Callbacks run to completion on the loop thread and must not block.
pub trait Handler {
    /// Client side only: the connect attempt resolved. On failure
    /// [`EventLoop::has_error`] is already true and the connection is torn
    /// down right after this returns.
    fn on_connect(&mut self, lp: &mut EventLoop, conn: ConnId) {
        let _ = (lp, conn);
    }

    /// Decodes the unconsumed inbound bytes.
    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode;

    /// A socket or decode error was recorded. Runs once, before
    /// [`Handler::on_close`].
    fn on_error(&mut self, lp: &mut EventLoop, conn: ConnId, error: &Error) {
        let _ = (lp, conn, error);
    }

    /// Client side only: the current exchange is complete and the caller may
    /// start new work. Keep-alive clients get this after every consumed
    /// response. Other clients get it once, at teardown.
    fn on_done(&mut self, lp: &mut EventLoop, conn: ConnId) {
        let _ = (lp, conn);
    }

    /// The connection is gone. Runs exactly once per connection.
    fn on_close(&mut self, lp: &mut EventLoop, conn: ConnId) {
        let _ = (lp, conn);
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn on_connect(&mut self, lp: &mut EventLoop, conn: ConnId) {
        (**self).on_connect(lp, conn)
    }

    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        (**self).on_message(lp, conn, data)
    }

    fn on_error(&mut self, lp: &mut EventLoop, conn: ConnId, error: &Error) {
        (**self).on_error(lp, conn, error)
    }

    fn on_done(&mut self, lp: &mut EventLoop, conn: ConnId) {
        (**self).on_done(lp, conn)
    }

    fn on_close(&mut self, lp: &mut EventLoop, conn: ConnId) {
        (**self).on_close(lp, conn)
    }
}
