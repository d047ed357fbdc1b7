use crate::net::utils::to_raw;

use libc::{AF_INET, AF_INET6, EINPROGRESS, F_GETFL, F_SETFL, O_NONBLOCK, SOCK_STREAM, fcntl};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub(crate) fn set_nonblocking(file_descriptor: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(file_descriptor, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { fcntl(file_descriptor, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Starts a non-blocking connect to `address`.
///
/// The outer error means no socket could be created. A socket whose connect
/// call failed outright is still returned, together with that failure, so
/// the caller can report it through the connection's callbacks.
pub(crate) fn connect(address: &SocketAddr) -> io::Result<(TcpStream, Option<io::Error>)> {
    let family = match address {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    };

    let file_descriptor = unsafe { libc::socket(family, SOCK_STREAM, 0) };
    if file_descriptor < 0 {
        return Err(io::Error::last_os_error());
    }

    let socket = unsafe { OwnedFd::from_raw_fd(file_descriptor) };
    set_cloexec(socket.as_raw_fd())?;
    set_nonblocking(socket.as_raw_fd())?;

    let (raw, len) = to_raw(address);
    let ret = unsafe {
        libc::connect(
            socket.as_raw_fd(),
            &raw as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };

    let failure = if ret < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(EINPROGRESS) => None,
            _ => Some(err),
        }
    } else {
        None
    };

    Ok((TcpStream::from(socket), failure))
}

fn set_cloexec(file_descriptor: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(file_descriptor, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { fcntl(file_descriptor, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
