//! OS readiness multiplexer.
//!
//! Registrations are level-triggered: a socket keeps being reported for as long
//! as it stays readable or writable, so the loop never has to drain a socket
//! in one go.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::EpollPoller as Poller;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::KqueuePoller as Poller;

use std::io;
use std::time::Duration;

/// Largest event batch a poller accepts per wait.
pub(crate) const MAX_EVENTS: usize = 1 << 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub(crate) const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
    pub(crate) hangup: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Event {
    pub(crate) token: u64,
    pub(crate) readiness: Readiness,
}

/// Poll timeout in whole milliseconds, rounded up so a deadline is never
/// reported early. `None` blocks indefinitely.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(duration) => {
            let nanos = duration.as_nanos();
            let millis = nanos.div_ceil(1_000_000);
            millis.min(i32::MAX as u128) as i32
        }
    }
}

/// Allocates the per-wait event batch. An oversized or unsatisfiable
/// capacity is an error, never an abort.
pub(crate) fn event_buffer<T: Clone>(capacity: usize, blank: T) -> io::Result<Vec<T>> {
    let capacity = capacity.max(1);
    if capacity > MAX_EVENTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("event capacity {capacity} exceeds {MAX_EVENTS}"),
        ));
    }

    let mut events = Vec::new();
    events
        .try_reserve_exact(capacity)
        .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
    events.resize(capacity, blank);

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(15))), 15);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }

    #[test]
    fn event_buffer_rejects_oversized_capacity() {
        assert_eq!(event_buffer(0, 0u8).unwrap().len(), 1);
        assert_eq!(event_buffer(MAX_EVENTS, 0u8).unwrap().len(), MAX_EVENTS);

        let err = event_buffer(MAX_EVENTS + 1, 0u8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(event_buffer(usize::MAX, 0u8).is_err());
    }
}
