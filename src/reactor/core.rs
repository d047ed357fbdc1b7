use crate::builder::{Config, LoopBuilder};
use crate::error::{Error, Result};
use crate::net::server::{Listener, ServerId};
use crate::reactor::io::{ConnId, Connection};
use crate::reactor::poller::{Event, Poller};
use crate::timer::{TimerId, Timers};
use crate::utils::slab::{Key, Slab};

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

pub(crate) enum Entry {
    Listener(Listener),
    Stream(Connection),
}

type StopHook = Box<dyn FnOnce(&mut EventLoop)>;

/// Single-threaded reactor multiplexing sockets and timers.
///
/// Every callback (connection handlers, accept hooks, timers, the stop hook)
/// runs on the thread that calls [`EventLoop::run`], one at a time, and gets
/// `&mut EventLoop` back so it can act on any other connection or timer.
///
/// # Example
/// ```no_run
/// use evnet::EventLoop;
/// use std::time::Duration;
///
/// let mut lp = EventLoop::new(1024).expect("event loop");
/// lp.add_timer(Duration::from_secs(1), Duration::ZERO, |lp, _| lp.stop());
/// lp.run().expect("run");
/// ```
pub struct EventLoop {
    pub(crate) poller: Poller,
    pub(crate) entries: Slab<Entry>,
    pub(crate) timers: Timers,
    pub(crate) deferred: VecDeque<ConnId>,
    pub(crate) config: Config,
    stopping: bool,
    on_stop: Option<StopHook>,
}

impl EventLoop {
    /// Creates a loop retrieving at most `capacity` events per wait.
    pub fn new(capacity: usize) -> Result<Self> {
        LoopBuilder::new().capacity(capacity).build()
    }

    pub fn builder() -> LoopBuilder {
        LoopBuilder::new()
    }

    pub(crate) fn with_config(config: Config) -> Result<Self> {
        let poller = Poller::new(config.capacity).map_err(Error::Setup)?;
        debug!(capacity = config.capacity, "event loop created");

        Ok(Self {
            poller,
            entries: Slab::new(64),
            timers: Timers::new(),
            deferred: VecDeque::new(),
            config,
            stopping: false,
            on_stop: None,
        })
    }

    /// Runs cycles until [`EventLoop::stop`] is called, then fires the stop
    /// hook and returns.
    ///
    /// Only a failing poller ends the loop with an error. Connection-level
    /// failures stay with their connection.
    pub fn run(&mut self) -> Result<()> {
        info!(
            entries = self.entries.len(),
            timers = self.timers.len(),
            "event loop running"
        );

        while !self.stopping {
            self.turn(None)?;
        }
        self.stopping = false;

        info!("event loop stopped");

        if let Some(hook) = self.on_stop.take() {
            hook(self);
        }

        Ok(())
    }

    /// Runs exactly one cycle: wait (at most `max_wait`, or until the next
    /// timer), dispatch readiness, run deferred handler calls, fire due
    /// timers.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<()> {
        let timeout = self.next_timeout(max_wait);
        let ready = self.poller.wait(timeout)?;

        for index in 0..ready {
            let Some(event) = self.poller.event(index) else {
                break;
            };
            self.dispatch(event);
        }

        self.run_deferred();
        self.fire_timers();

        Ok(())
    }

    /// Requests termination once the current cycle completes.
    pub fn stop(&mut self) {
        debug!("stop requested");
        self.stopping = true;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Hook run once, after the loop stops and before [`EventLoop::run`]
    /// returns.
    pub fn set_stop_callback<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.on_stop = Some(Box::new(hook));
    }

    /// Number of live connections and listeners.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Arms a new timer firing after `initial`, then every `interval` unless
    /// `interval` is zero. `(0, 0)` creates it disarmed.
    pub fn add_timer<F>(&mut self, initial: Duration, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut EventLoop, TimerId) + 'static,
    {
        let id = self.timers.insert(initial, interval, Box::new(callback));
        debug!(timer = %id, ?initial, ?interval, "timer added");
        id
    }

    /// Re-arms `id` relative to now, dropping any pending firing.
    /// `(0, 0)` disarms it; it stays valid and may be re-armed later.
    ///
    /// Returns `false` if the timer was removed.
    pub fn reset_timer(&mut self, id: TimerId, initial: Duration, interval: Duration) -> bool {
        let found = self.timers.reset(id, initial, interval);
        if found {
            debug!(timer = %id, ?initial, ?interval, "timer reset");
        } else {
            debug!(timer = %id, "reset of a removed timer ignored");
        }
        found
    }

    /// Destroys a timer. Safe to call from the timer's own callback.
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        let found = self.timers.remove(id);
        if found {
            debug!(timer = %id, "timer removed");
        }
        found
    }

    pub fn is_timer_armed(&self, id: TimerId) -> bool {
        self.timers.is_armed(id)
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.contains(id)
    }

    fn next_timeout(&mut self, max_wait: Option<Duration>) -> Option<Duration> {
        if !self.deferred.is_empty() {
            return Some(Duration::ZERO);
        }

        let until_timer = self
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        match (until_timer, max_wait) {
            (Some(timer), Some(max)) => Some(timer.min(max)),
            (timer, max) => timer.or(max),
        }
    }

    fn dispatch(&mut self, event: Event) {
        let key = Key::from_token(event.token);

        match self.entries.get(key) {
            Some(Entry::Listener(_)) => self.accept_ready(ServerId(key)),
            Some(Entry::Stream(_)) => self.connection_ready(ConnId(key), event.readiness),
            None => trace!(token = event.token, "event for a retired entry"),
        }
    }

    fn run_deferred(&mut self) {
        // Anything deferred during this pass waits for the next cycle.
        let pending = std::mem::take(&mut self.deferred);
        for conn in pending {
            self.resume(conn);
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();

        for _ in 0..self.config.max_timers_per_cycle {
            let Some(id) = self.timers.pop_expired(now) else {
                break;
            };
            let Some(mut checked_out) = self.timers.check_out(id) else {
                continue;
            };

            trace!(timer = %id, "timer fired");
            (checked_out.callback())(self, id);
            self.timers.check_in(id, checked_out);
        }
    }
}
