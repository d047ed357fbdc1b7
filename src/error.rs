//! Error type shared by the loop, connections and timers.

use crate::reactor::ConnId;

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The poller (or another loop-wide resource) could not be created.
    #[error("event loop setup failed: {0}")]
    Setup(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("cannot resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection {conn} failed: {source}")]
    Socket {
        conn: ConnId,
        #[source]
        source: io::Error,
    },

    /// The handler rejected the inbound byte stream.
    #[error("malformed frame on connection {0}")]
    Decode(ConnId),

    /// The handle no longer refers to a live connection, or the connection
    /// has failed and refuses further sends.
    #[error("connection {0} is closed")]
    Closed(ConnId),
}

impl Error {
    /// The underlying OS error kind, if this error came from a socket.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Setup(source)
            | Error::Io(source)
            | Error::Connect { source, .. }
            | Error::Socket { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}
