//! Listening side: accept loop and per-connection handler creation.
//!
//! # Usage
//!
//! ```no_run
//! use evnet::{ConnId, Decode, EventLoop, Handler, Server};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
//!         let _ = lp.write(conn, data);
//!         Decode::Consumed(data.len())
//!     }
//! }
//!
//! let mut lp = EventLoop::new(1024).unwrap();
//! let server = Server::bind(&mut lp, "127.0.0.1", 7000, |_, _| Box::new(Echo)).unwrap();
//! println!("listening on {}", server.local_addr());
//! lp.run().unwrap();
//! ```

use crate::error::Result;
use crate::handler::Handler;
use crate::net::utils::resolve;
use crate::reactor::core::{Entry, EventLoop};
use crate::reactor::io::{ConnId, Connection, Role};
use crate::reactor::poller::Interest;
use crate::utils::slab::Key;

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use tracing::{debug, info, warn};

type Acceptor = Box<dyn FnMut(&mut EventLoop, ConnId) -> Box<dyn Handler>>;

/// Handle to a listening socket owned by an [`EventLoop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServerId(pub(crate) Key);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server#{}", self.0)
    }
}

pub(crate) struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    acceptor: Option<Acceptor>,
}

/// A bound, listening server.
///
/// The accept hook runs once per accepted connection and returns the
/// connection's handler. It may already send on the new connection, or close
/// it to reject the peer.
#[derive(Clone, Copy, Debug)]
pub struct Server {
    id: ServerId,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds `host:port` and starts accepting on the next loop cycle.
    /// Port 0 picks an ephemeral port; see [`Server::local_addr`].
    pub fn bind<F>(lp: &mut EventLoop, host: &str, port: u16, on_accept: F) -> Result<Server>
    where
        F: FnMut(&mut EventLoop, ConnId) -> Box<dyn Handler> + 'static,
    {
        let address = resolve(host, port)?;
        let socket = TcpListener::bind(address)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let fd = socket.as_raw_fd();

        let key = lp.entries.insert(Entry::Listener(Listener {
            socket,
            local_addr,
            acceptor: Some(Box::new(on_accept)),
        }));

        if let Err(err) = lp.poller.register(fd, key.to_token(), Interest::READ) {
            lp.entries.remove(key);
            return Err(err.into());
        }

        let id = ServerId(key);
        info!(server = %id, addr = %local_addr, "listening");

        Ok(Server { id, local_addr })
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops listening. Established connections are left alone.
    pub fn shutdown(self, lp: &mut EventLoop) -> bool {
        lp.close_server(self.id)
    }
}

impl EventLoop {
    /// Stops accepting on `id` and releases the listening socket.
    pub fn close_server(&mut self, id: ServerId) -> bool {
        let (fd, local_addr) = match self.entries.get(id.0) {
            Some(Entry::Listener(listener)) => (listener.socket.as_raw_fd(), listener.local_addr),
            _ => return false,
        };

        if let Err(err) = self.poller.deregister(fd, Interest::READ) {
            debug!(server = %id, error = %err, "deregister failed");
        }
        self.entries.remove(id.0);
        info!(server = %id, addr = %local_addr, "listener closed");

        true
    }

    pub(crate) fn accept_ready(&mut self, id: ServerId) {
        for _ in 0..self.config.accept_batch {
            let accepted = match self.entries.get(id.0) {
                Some(Entry::Listener(listener)) => listener.socket.accept(),
                _ => return,
            };

            match accepted {
                Ok((stream, peer)) => self.adopt(id, stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) => {}
                Err(err) => {
                    // Typically descriptor exhaustion; retried next cycle.
                    warn!(server = %id, error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    fn adopt(&mut self, id: ServerId, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nonblocking(true) {
            warn!(server = %id, peer = %peer, error = %err, "dropping accepted socket");
            return;
        }
        if self.config.nodelay {
            let _ = stream.set_nodelay(true);
        }

        let connection = Connection::new(stream, peer, Role::Accepted, true);
        let conn = match self.register_connection(connection) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(server = %id, peer = %peer, error = %err, "dropping accepted socket");
                return;
            }
        };

        let acceptor = match self.entries.get_mut(id.0) {
            Some(Entry::Listener(listener)) => listener.acceptor.take(),
            _ => None,
        };
        let Some(mut acceptor) = acceptor else {
            self.close(conn);
            self.finalize(conn, None);
            return;
        };

        debug!(server = %id, conn = %conn, peer = %peer, "accepted");
        let handler = acceptor(self, conn);

        if let Some(Entry::Listener(listener)) = self.entries.get_mut(id.0) {
            listener.acceptor = Some(acceptor);
        }
        self.check_in(conn, handler);
    }
}
