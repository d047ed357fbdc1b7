use super::{Event, Interest, Readiness, event_buffer, timeout_millis};

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub(crate) struct EpollPoller {
    epoll: OwnedFd,
    events: Vec<epoll_event>,
    ready: usize,
}

impl EpollPoller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        let events = event_buffer(capacity, epoll_event { events: 0, u64: 0 })?;

        Ok(Self {
            epoll,
            events,
            ready: 0,
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn reregister(
        &self,
        fd: RawFd,
        token: u64,
        _previous: Interest,
        interest: Interest,
    ) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd, _previous: Interest) -> io::Result<()> {
        let ret = unsafe {
            epoll_ctl(
                self.epoll.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Waits for readiness. Returns the number of events now available
    /// through [`EpollPoller::event`]. An interrupted wait reports zero
    /// events.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                i32::try_from(self.events.len()).unwrap_or(i32::MAX),
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            self.ready = 0;
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        self.ready = n as usize;
        Ok(self.ready)
    }

    pub(crate) fn event(&self, index: usize) -> Option<Event> {
        if index >= self.ready {
            return None;
        }

        let raw = self.events[index];
        let bits = raw.events as i32;
        let token = raw.u64;

        Some(Event {
            token,
            readiness: Readiness {
                readable: bits & (EPOLLIN | EPOLLRDHUP) != 0,
                writable: bits & EPOLLOUT != 0,
                error: bits & EPOLLERR != 0,
                hangup: bits & EPOLLHUP != 0,
            },
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut bits = 0;
        if interest.read {
            bits |= EPOLLIN | EPOLLRDHUP;
        }
        if interest.write {
            bits |= EPOLLOUT;
        }

        let mut event = epoll_event {
            events: bits as u32,
            u64: token,
        };

        let ret = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}
