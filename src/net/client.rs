use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::net::utils::resolve;
use crate::reactor::core::EventLoop;
use crate::reactor::io::{ConnId, Connection, Role};
use crate::reactor::socket;

use tracing::debug;

/// Outbound connection builder.
///
/// # Example
/// ```no_run
/// use evnet::{Client, ConnId, Decode, EventLoop, Handler};
///
/// struct Get;
///
/// impl Handler for Get {
///     fn on_connect(&mut self, lp: &mut EventLoop, conn: ConnId) {
///         if !lp.has_error(conn) {
///             let _ = lp.write(conn, "GET / HTTP/1.0\r\n\r\n");
///         }
///     }
///
///     fn on_message(&mut self, _: &mut EventLoop, _: ConnId, data: &[u8]) -> Decode {
///         print!("{}", String::from_utf8_lossy(data));
///         Decode::Consumed(data.len())
///     }
/// }
///
/// let mut lp = EventLoop::new(64).unwrap();
/// Client::new("example.com", 80).connect(&mut lp, Get).unwrap();
/// lp.run().unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    host: String,
    port: u16,
    keep_alive: bool,
}

impl Client {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive: false,
        }
    }

    /// A keep-alive client gets [`Handler::on_done`] after every consumed
    /// response instead of once at teardown, so it can issue the next request
    /// on the same connection.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Starts connecting and returns immediately.
    ///
    /// Fails only if the host does not resolve or no socket can be created.
    /// Connect errors (refused, unreachable) surface through the handler:
    /// `on_connect` with [`EventLoop::has_error`] set, then `on_error` and
    /// `on_close`.
    pub fn connect<H>(self, lp: &mut EventLoop, handler: H) -> Result<ConnId>
    where
        H: Handler + 'static,
    {
        let address = resolve(&self.host, self.port)?;
        let (stream, failure) = socket::connect(&address)?;

        let role = Role::Client {
            host: self.host,
            port: self.port,
            keep_alive: self.keep_alive,
        };
        let mut connection = Connection::new(stream, address, role, false);
        connection.handler = Some(Box::new(handler));

        let failed = failure.is_some();
        if let Some(source) = failure {
            connection.failed = true;
            connection.error = Some(Error::Connect {
                addr: address,
                source,
            });
        }

        let conn = lp.register_connection(connection)?;
        debug!(conn = %conn, peer = %address, "connecting");

        // Reported from the loop, never from inside this call.
        if failed {
            lp.defer(conn);
        }

        Ok(conn)
    }
}
