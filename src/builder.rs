//! Fluent builder for [`EventLoop`] construction.

use crate::error::Result;
use crate::reactor::EventLoop;

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_READ_SIZE: usize = 16 * 1024;
const DEFAULT_TIMER_BATCH: usize = 1024;
const DEFAULT_ACCEPT_BATCH: usize = 64;

/// Settings fixed at construction time.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) capacity: usize,
    pub(crate) read_size: usize,
    pub(crate) max_timers_per_cycle: usize,
    pub(crate) accept_batch: usize,
    pub(crate) nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            read_size: DEFAULT_READ_SIZE,
            max_timers_per_cycle: DEFAULT_TIMER_BATCH,
            accept_batch: DEFAULT_ACCEPT_BATCH,
            nodelay: true,
        }
    }
}

/// Builder for [`EventLoop`] instances.
///
/// # Example
/// ```no_run
/// use evnet::LoopBuilder;
///
/// let lp = LoopBuilder::new()
///     .capacity(256)
///     .read_size(4096)
///     .build()
///     .expect("event loop");
/// ```
#[derive(Clone, Debug, Default)]
pub struct LoopBuilder {
    config: Config,
}

impl LoopBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of readiness events retrieved per wait. This bounds the
    /// work done per cycle, not the number of connections. [`LoopBuilder::build`]
    /// fails if the event batch cannot be allocated.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity.clamp(1, i32::MAX as usize);
        self
    }

    /// Bytes read from a socket per readiness event.
    pub fn read_size(mut self, read_size: usize) -> Self {
        self.config.read_size = read_size.max(1);
        self
    }

    /// Upper bound on timers fired in one cycle. Anything left over fires on
    /// the next cycle, after ready sockets have been served.
    pub fn max_timers_per_cycle(mut self, max: usize) -> Self {
        self.config.max_timers_per_cycle = max.max(1);
        self
    }

    /// Upper bound on connections accepted per listener per cycle.
    pub fn accept_batch(mut self, batch: usize) -> Self {
        self.config.accept_batch = batch.max(1);
        self
    }

    /// Whether connections get `TCP_NODELAY`.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.config.nodelay = nodelay;
        self
    }

    /// Creates the loop. Fails if the OS poller cannot be created.
    pub fn build(self) -> Result<EventLoop> {
        EventLoop::with_config(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactor::poller::MAX_EVENTS;

    #[test]
    fn oversized_capacity_fails_construction() {
        let result = LoopBuilder::new().capacity(usize::MAX).build();
        assert!(matches!(result, Err(Error::Setup(_))));

        assert!(matches!(EventLoop::new(MAX_EVENTS + 1), Err(Error::Setup(_))));
    }

    #[test]
    fn capacity_is_clamped_to_poller_range() {
        let builder = LoopBuilder::new().capacity(0);
        assert_eq!(builder.config.capacity, 1);

        let builder = LoopBuilder::new().capacity(usize::MAX);
        assert_eq!(builder.config.capacity, i32::MAX as usize);

        assert!(LoopBuilder::new().capacity(MAX_EVENTS).build().is_ok());
    }
}
