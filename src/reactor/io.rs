//! Per-connection state and buffered non-blocking I/O.
//!
//! A connection owns its socket, the unconsumed inbound bytes, the queue of
//! outbound buffers and its [`Handler`]. While a callback runs, the handler
//! (and, for `on_message`, the inbound buffer) is checked out of the entry so
//! the callback can hold `&mut EventLoop`. A connection closed while its
//! handler is checked out is finalized when the handler is checked back in.

use crate::buffer::{Buffer, OutQueue};
use crate::error::{Error, Result};
use crate::handler::{Decode, Handler};
use crate::reactor::core::{Entry, EventLoop};
use crate::reactor::poller::{Interest, Readiness};
use crate::utils::slab::Key;

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use tracing::{debug, trace, warn};

/// Handle to a connection owned by an [`EventLoop`].
///
/// Handles are generational: once the connection is gone its handle never
/// resolves again, even after the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) Key);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Client connect in progress.
    Connecting,
    Established,
    /// Flushing queued output before closing.
    Closing,
    /// Torn down; waiting for the running callback to return.
    Closed,
}

#[derive(Debug)]
pub(crate) enum Role {
    Accepted,
    Client {
        host: String,
        port: u16,
        keep_alive: bool,
    },
}

pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) state: ConnState,
    pub(crate) connected: bool,
    pub(crate) interest: Interest,
    pub(crate) inbound: Buffer,
    pub(crate) outbound: OutQueue,
    pub(crate) handler: Option<Box<dyn Handler>>,
    pub(crate) role: Role,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) error: Option<Error>,
    pub(crate) failed: bool,
    pub(crate) deferred: bool,
    pub(crate) read_closed: bool,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr, role: Role, connected: bool) -> Self {
        Self {
            stream,
            state: if connected {
                ConnState::Established
            } else {
                ConnState::Connecting
            },
            connected,
            interest: Interest::NONE,
            inbound: Buffer::new(),
            outbound: OutQueue::default(),
            handler: None,
            role,
            peer_addr,
            error: None,
            failed: false,
            deferred: false,
            read_closed: false,
        }
    }

    fn keep_alive(&self) -> bool {
        matches!(self.role, Role::Client { keep_alive: true, .. })
    }

    fn desired_interest(&self) -> Interest {
        if self.state == ConnState::Closed {
            return Interest::NONE;
        }
        if !self.connected {
            return Interest::WRITE;
        }

        Interest {
            read: self.state == ConnState::Established && !self.read_closed,
            write: !self.outbound.is_empty(),
        }
    }
}

impl EventLoop {
    /// Adds a connection to the loop and registers it with the poller.
    pub(crate) fn register_connection(&mut self, mut connection: Connection) -> Result<ConnId> {
        let fd = connection.stream.as_raw_fd();
        let interest = connection.desired_interest();
        connection.interest = interest;

        let key = self.entries.insert(Entry::Stream(connection));
        if let Err(err) = self.poller.register(fd, key.to_token(), interest) {
            self.entries.remove(key);
            return Err(err.into());
        }

        Ok(ConnId(key))
    }

    pub(crate) fn connection(&self, conn: ConnId) -> Option<&Connection> {
        match self.entries.get(conn.0) {
            Some(Entry::Stream(connection)) => Some(connection),
            _ => None,
        }
    }

    pub(crate) fn connection_mut(&mut self, conn: ConnId) -> Option<&mut Connection> {
        match self.entries.get_mut(conn.0) {
            Some(Entry::Stream(connection)) => Some(connection),
            _ => None,
        }
    }

    /// Current state, or `None` once the connection is gone.
    pub fn state(&self, conn: ConnId) -> Option<ConnState> {
        self.connection(conn).map(|c| c.state)
    }

    /// True while the connection can still carry traffic (connecting,
    /// established or flushing before close).
    pub fn is_open(&self, conn: ConnId) -> bool {
        matches!(
            self.state(conn),
            Some(ConnState::Connecting | ConnState::Established | ConnState::Closing)
        )
    }

    /// Whether a socket, connect or decode error was recorded.
    pub fn has_error(&self, conn: ConnId) -> bool {
        self.connection(conn).is_some_and(|c| c.failed)
    }

    pub fn peer_addr(&self, conn: ConnId) -> Option<SocketAddr> {
        self.connection(conn).map(|c| c.peer_addr)
    }

    pub fn local_addr(&self, conn: ConnId) -> Option<SocketAddr> {
        self.connection(conn)
            .and_then(|c| c.stream.local_addr().ok())
    }

    /// Host and port a client connection was opened with.
    pub fn client_peer(&self, conn: ConnId) -> Option<(&str, u16)> {
        match &self.connection(conn)?.role {
            Role::Client { host, port, .. } => Some((host.as_str(), *port)),
            Role::Accepted => None,
        }
    }

    pub fn is_keep_alive(&self, conn: ConnId) -> bool {
        self.connection(conn).is_some_and(Connection::keep_alive)
    }

    /// Bytes queued and not yet accepted by the kernel.
    pub fn pending_bytes(&self, conn: ConnId) -> usize {
        self.connection(conn)
            .map_or(0, |c| c.outbound.pending_bytes())
    }

    /// Number of buffers waiting in the outbound queue.
    pub fn queued_buffers(&self, conn: ConnId) -> usize {
        self.connection(conn).map_or(0, |c| c.outbound.len())
    }

    /// Appends a buffer to the outbound queue without sending.
    pub fn enqueue(&mut self, conn: ConnId, buffer: impl Into<Buffer>) -> Result<()> {
        let connection = self.connection_mut(conn).ok_or(Error::Closed(conn))?;
        if connection.state == ConnState::Closed || connection.failed {
            return Err(Error::Closed(conn));
        }

        connection.outbound.push(buffer.into());
        Ok(())
    }

    /// Writes as much of the outbound queue as the socket accepts right now.
    /// The rest goes out when the socket becomes writable. Data queued on a
    /// connecting client is sent once the connect completes.
    ///
    /// A write error fails and closes the connection.
    pub fn send(&mut self, conn: ConnId) -> Result<()> {
        let connection = self.connection(conn).ok_or(Error::Closed(conn))?;
        if connection.state == ConnState::Closed || connection.failed {
            return Err(Error::Closed(conn));
        }
        if !connection.connected {
            return Ok(());
        }

        self.flush(conn)
    }

    /// [`EventLoop::enqueue`] followed by [`EventLoop::send`].
    pub fn write(&mut self, conn: ConnId, buffer: impl Into<Buffer>) -> Result<()> {
        self.enqueue(conn, buffer)?;
        self.send(conn)
    }

    /// Closes once every queued buffer has been written.
    pub fn set_close(&mut self, conn: ConnId) {
        let Some(connection) = self.connection_mut(conn) else {
            return;
        };
        if matches!(connection.state, ConnState::Closing | ConnState::Closed) {
            return;
        }

        connection.state = ConnState::Closing;
        let drained = connection.connected && connection.outbound.is_empty();
        debug!(conn = %conn, pending = connection.outbound.pending_bytes(), "closing after flush");

        if drained {
            self.close(conn);
        } else {
            self.sync_interest(conn);
        }
    }

    /// Closes immediately, discarding queued output.
    ///
    /// Teardown callbacks run right away, or as soon as the connection's
    /// running callback returns.
    pub fn close(&mut self, conn: ConnId) {
        let Some(connection) = self.connection_mut(conn) else {
            debug!(conn = %conn, "close of a retired connection ignored");
            return;
        };
        if connection.state == ConnState::Closed {
            return;
        }

        connection.state = ConnState::Closed;
        connection.outbound.clear();
        connection.inbound.clear();
        let _ = connection.stream.shutdown(Shutdown::Both);

        let fd = connection.stream.as_raw_fd();
        let previous = mem::replace(&mut connection.interest, Interest::NONE);
        let busy = connection.handler.is_none();

        if let Err(err) = self.poller.deregister(fd, previous) {
            trace!(conn = %conn, error = %err, "deregister failed");
        }
        debug!(conn = %conn, "connection closed");

        if !busy {
            self.finalize(conn, None);
        }
    }

    /// Records `error` and closes. Only the first error is kept.
    pub(crate) fn fail(&mut self, conn: ConnId, error: Error) {
        let Some(connection) = self.connection_mut(conn) else {
            return;
        };
        if connection.state == ConnState::Closed {
            return;
        }

        warn!(conn = %conn, error = %error, "connection failed");
        connection.failed = true;
        if connection.error.is_none() {
            connection.error = Some(error);
        }

        self.close(conn);
    }

    /// Removes a closed connection and runs its teardown callbacks.
    pub(crate) fn finalize(&mut self, conn: ConnId, handler: Option<Box<dyn Handler>>) {
        let Some(Entry::Stream(mut connection)) = self.entries.remove(conn.0) else {
            return;
        };
        let Some(mut handler) = handler.or_else(|| connection.handler.take()) else {
            return;
        };

        let error = connection.error.take();
        let done = matches!(connection.role, Role::Client { keep_alive: false, .. });
        drop(connection);

        if let Some(error) = error {
            handler.on_error(self, conn, &error);
        }
        if done {
            handler.on_done(self, conn);
        }
        handler.on_close(self, conn);
    }

    fn check_out(&mut self, conn: ConnId) -> Option<Box<dyn Handler>> {
        let connection = self.connection_mut(conn)?;
        if connection.state == ConnState::Closed {
            return None;
        }
        connection.handler.take()
    }

    /// Hands the handler back after a callback. Finalizes the connection if
    /// it was closed meanwhile.
    pub(crate) fn check_in(&mut self, conn: ConnId, handler: Box<dyn Handler>) {
        match self.state(conn) {
            Some(ConnState::Closed) => self.finalize(conn, Some(handler)),
            Some(_) => {
                if let Some(connection) = self.connection_mut(conn) {
                    connection.handler = Some(handler);
                }
            }
            None => {}
        }
    }

    /// Queues `conn` for the deferred pass at the end of this cycle's
    /// dispatch, or the next cycle if that pass is already running.
    pub(crate) fn defer(&mut self, conn: ConnId) {
        let Some(connection) = self.connection_mut(conn) else {
            return;
        };
        if !connection.deferred {
            connection.deferred = true;
            self.deferred.push_back(conn);
        }
    }

    pub(crate) fn resume(&mut self, conn: ConnId) {
        let Some(connection) = self.connection_mut(conn) else {
            return;
        };
        connection.deferred = false;

        if connection.connected {
            self.process_inbound(conn, true);
        } else {
            self.finish_connect(conn);
        }
    }

    pub(crate) fn sync_interest(&mut self, conn: ConnId) {
        let Some(connection) = self.connection_mut(conn) else {
            return;
        };

        let desired = connection.desired_interest();
        if desired == connection.interest {
            return;
        }

        let previous = mem::replace(&mut connection.interest, desired);
        let fd = connection.stream.as_raw_fd();

        if let Err(source) = self.poller.reregister(fd, conn.0.to_token(), previous, desired) {
            self.fail(conn, Error::Socket { conn, source });
        }
    }

    pub(crate) fn connection_ready(&mut self, conn: ConnId, readiness: Readiness) {
        let Some(connection) = self.connection(conn) else {
            return;
        };
        let (state, connected) = (connection.state, connection.connected);

        if !connected {
            if readiness.writable || readiness.error || readiness.hangup {
                self.finish_connect(conn);
            }
            return;
        }

        match state {
            ConnState::Established => {
                if readiness.readable || readiness.hangup || readiness.error {
                    self.read_ready(conn);
                }
                if readiness.writable && self.is_open(conn) {
                    let _ = self.flush(conn);
                }
            }
            ConnState::Closing => {
                if readiness.writable || readiness.error || readiness.hangup {
                    let _ = self.flush(conn);
                }
                // Hung up with output still queued and nothing left to write to.
                if readiness.hangup && self.is_open(conn) {
                    self.fail(
                        conn,
                        Error::Socket {
                            conn,
                            source: io::ErrorKind::BrokenPipe.into(),
                        },
                    );
                }
            }
            ConnState::Connecting | ConnState::Closed => {}
        }
    }

    fn read_ready(&mut self, conn: ConnId) {
        let read_size = self.config.read_size;
        let Some(connection) = self.connection_mut(conn) else {
            return;
        };

        let stream = &mut connection.stream;
        let result = connection
            .inbound
            .fill_with(read_size, |spare| stream.read(spare));

        match result {
            Ok(0) => {
                debug!(conn = %conn, "peer closed");
                connection.read_closed = true;
                self.set_close(conn);
            }
            Ok(n) => {
                trace!(conn = %conn, len = n, "read");
                self.process_inbound(conn, false);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(source) => self.fail(conn, Error::Socket { conn, source }),
        }
    }

    /// Offers the inbound bytes to the handler until it stops consuming.
    /// `force` invokes it once even with nothing buffered.
    fn process_inbound(&mut self, conn: ConnId, mut force: bool) {
        loop {
            let Some(connection) = self.connection_mut(conn) else {
                return;
            };
            if connection.state != ConnState::Established {
                return;
            }
            if connection.inbound.is_empty() && !force {
                return;
            }
            force = false;

            let keep_alive = connection.keep_alive();
            let mut inbound = mem::take(&mut connection.inbound);
            let Some(mut handler) = self.check_out(conn) else {
                if let Some(connection) = self.connection_mut(conn) {
                    connection.inbound = inbound;
                }
                return;
            };

            let offered = inbound.len();
            let verdict = match handler.on_message(self, conn, inbound.as_slice()) {
                Decode::Consumed(n) if n > offered => {
                    warn!(conn = %conn, consumed = n, offered, "handler consumed more than offered");
                    Decode::Consumed(offered)
                }
                verdict => verdict,
            };

            if let Decode::Consumed(n) = verdict {
                inbound.consume(n);
                if n > 0 && keep_alive && self.is_open(conn) {
                    handler.on_done(self, conn);
                }
            }

            if let Some(connection) = self.connection_mut(conn) {
                if connection.state != ConnState::Closed {
                    connection.inbound = inbound;
                }
            }
            self.check_in(conn, handler);

            match verdict {
                Decode::Consumed(0) | Decode::Again => return,
                Decode::Consumed(_) => {}
                Decode::Retry => {
                    self.defer(conn);
                    return;
                }
                Decode::Error => {
                    self.fail(conn, Error::Decode(conn));
                    return;
                }
            }
        }
    }

    fn flush(&mut self, conn: ConnId) -> Result<()> {
        let Some(connection) = self.connection_mut(conn) else {
            return Err(Error::Closed(conn));
        };

        let mut written = 0;
        let failure = loop {
            let Some(head) = connection.outbound.head() else {
                break None;
            };

            match connection.stream.write(head) {
                Ok(0) => break Some(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    connection.outbound.advance(n);
                    written += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break None,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Some(err),
            }
        };

        if written > 0 {
            trace!(
                conn = %conn,
                len = written,
                pending = connection.outbound.pending_bytes(),
                "flushed"
            );
        }

        let drained = connection.outbound.is_empty();
        let closing = connection.state == ConnState::Closing;

        if let Some(source) = failure {
            self.fail(conn, Error::Socket { conn, source });
            return Err(Error::Closed(conn));
        }

        if drained && closing {
            self.close(conn);
        } else {
            self.sync_interest(conn);
        }

        Ok(())
    }

    /// Resolves a pending connect: reports it through `on_connect`, then
    /// either starts sending queued output or tears the connection down.
    pub(crate) fn finish_connect(&mut self, conn: ConnId) {
        let nodelay = self.config.nodelay;
        let Some(connection) = self.connection_mut(conn) else {
            return;
        };
        if connection.connected || connection.state == ConnState::Closed {
            return;
        }

        let outcome = if connection.failed {
            Ok(false)
        } else {
            match connection.stream.take_error() {
                Ok(None) => match connection.stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(_) => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
                },
                Ok(Some(err)) | Err(err) => Err(err),
            }
        };

        let connected = match outcome {
            Ok(connected) => connected,
            Err(source) => {
                connection.failed = true;
                connection.error = Some(Error::Connect {
                    addr: connection.peer_addr,
                    source,
                });
                false
            }
        };

        if connected {
            connection.connected = true;
            if connection.state == ConnState::Connecting {
                connection.state = ConnState::Established;
            }
            if nodelay {
                let _ = connection.stream.set_nodelay(true);
            }
            debug!(conn = %conn, peer = %connection.peer_addr, "connected");
            self.sync_interest(conn);
        } else {
            debug!(conn = %conn, peer = %connection.peer_addr, "connect failed");
        }

        if let Some(mut handler) = self.check_out(conn) {
            handler.on_connect(self, conn);
            self.check_in(conn, handler);
        }

        if !connected {
            self.close(conn);
        } else if self.is_open(conn) {
            let _ = self.flush(conn);
        }
    }
}
