use super::{Event, Interest, Readiness, event_buffer};

use libc::{EV_ADD, EV_DELETE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent, kqueue};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

pub(crate) struct KqueuePoller {
    kqueue: OwnedFd,
    events: Vec<kevent>,
    ready: usize,
}

fn change(fd: RawFd, filter: i16, flags: u16, token: u64) -> kevent {
    let mut event: kevent = unsafe { std::mem::zeroed() };
    event.ident = fd as usize;
    event.filter = filter as _;
    event.flags = flags as _;
    event.udata = token as usize as *mut _;
    event
}

impl KqueuePoller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let fd = unsafe { kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let kqueue = unsafe { OwnedFd::from_raw_fd(fd) };
        let events = event_buffer(capacity, unsafe { std::mem::zeroed::<kevent>() })?;

        Ok(KqueuePoller {
            kqueue,
            events,
            ready: 0,
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.reregister(fd, token, Interest::NONE, interest)
    }

    pub(crate) fn reregister(
        &self,
        fd: RawFd,
        token: u64,
        previous: Interest,
        interest: Interest,
    ) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);

        if interest.read && !previous.read {
            changes.push(change(fd, EVFILT_READ as i16, EV_ADD as u16, token));
        } else if !interest.read && previous.read {
            changes.push(change(fd, EVFILT_READ as i16, EV_DELETE as u16, token));
        }

        if interest.write && !previous.write {
            changes.push(change(fd, EVFILT_WRITE as i16, EV_ADD as u16, token));
        } else if !interest.write && previous.write {
            changes.push(change(fd, EVFILT_WRITE as i16, EV_DELETE as u16, token));
        }

        self.apply(&changes)
    }

    pub(crate) fn deregister(&self, fd: RawFd, previous: Interest) -> io::Result<()> {
        self.reregister(fd, 0, previous, Interest::NONE)
    }

    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(i64::MAX as u64) as _,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |ts| ts as *const libc::timespec);

        let n = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                libc::c_int::try_from(self.events.len()).unwrap_or(libc::c_int::MAX),
                ts_ptr,
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

        let raw = &self.events[index];
        let flags = raw.flags as u16;
        let filter = raw.filter as i16;

        Some(Event {
            token: raw.udata as usize as u64,
            readiness: Readiness {
                readable: filter == EVFILT_READ as i16,
                writable: filter == EVFILT_WRITE as i16,
                error: flags & (EV_ERROR as u16) != 0,
                hangup: flags & (EV_EOF as u16) != 0 && filter == EVFILT_WRITE as i16,
            },
        })
    }

    fn apply(&self, changes: &[kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let ret = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}
