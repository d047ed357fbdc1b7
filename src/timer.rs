//! Timer set for the event loop.
//!
//! Armed deadlines live in a min-heap. Re-arming never searches the heap:
//! every reset bumps the timer's epoch and pushes a fresh entry, and entries
//! with an outdated epoch are dropped when they reach the top. A timer's
//! callback is checked out of its slot while it runs, so the callback may
//! reset or remove itself, or arm siblings, without disturbing the heap.

use crate::reactor::EventLoop;
use crate::utils::slab::{Key, Slab};

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::{Duration, Instant};

pub(crate) type TimerCallback = Box<dyn FnMut(&mut EventLoop, TimerId)>;

/// Handle to a timer owned by an [`EventLoop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) Key);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

struct TimerSlot {
    deadline: Option<Instant>,
    interval: Duration,
    epoch: u64,
    callback: Option<TimerCallback>,
}

struct HeapEntry {
    deadline: Instant,
    seq: u64,
    key: Key,
    epoch: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties fire in arming order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Callback taken out of a firing timer, to be handed back with
/// [`Timers::check_in`].
pub(crate) struct CheckedOut {
    callback: TimerCallback,
    epoch: u64,
}

impl CheckedOut {
    pub(crate) fn callback(&mut self) -> &mut TimerCallback {
        &mut self.callback
    }
}

pub(crate) struct Timers {
    slots: Slab<TimerSlot>,
    heap: BinaryHeap<HeapEntry>,
    seq: u64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            slots: Slab::new(16),
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub(crate) fn insert(
        &mut self,
        initial: Duration,
        interval: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        let key = self.slots.insert(TimerSlot {
            deadline: None,
            interval,
            epoch: 0,
            callback: Some(callback),
        });

        let id = TimerId(key);
        self.reset(id, initial, interval);
        id
    }

    /// Re-arms relative to now, or disarms when both durations are zero.
    /// Returns `false` if the timer no longer exists.
    pub(crate) fn reset(&mut self, id: TimerId, initial: Duration, interval: Duration) -> bool {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return false;
        };

        slot.epoch += 1;
        slot.interval = interval;

        if initial.is_zero() && interval.is_zero() {
            slot.deadline = None;
            return true;
        }

        let deadline = Instant::now() + initial;
        slot.deadline = Some(deadline);
        let epoch = slot.epoch;
        self.push(deadline, id.0, epoch);

        true
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> bool {
        let removed = self.slots.remove(id.0).is_some();
        if removed {
            self.compact();
        }
        removed
    }

    pub(crate) fn is_armed(&self, id: TimerId) -> bool {
        self.slots
            .get(id.0)
            .is_some_and(|slot| slot.deadline.is_some())
    }

    pub(crate) fn contains(&self, id: TimerId) -> bool {
        self.slots.contains(id.0)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Earliest live deadline, discarding stale heap entries on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }

        None
    }

    /// Pops the next timer whose deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerId> {
        loop {
            let top = self.heap.peek()?;
            if !self.is_live(top) {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                return None;
            }

            let entry = self.heap.pop()?;
            return Some(TimerId(entry.key));
        }
    }

    /// Takes the callback out of an expired timer and marks it disarmed for
    /// the duration of the call.
    pub(crate) fn check_out(&mut self, id: TimerId) -> Option<CheckedOut> {
        let slot = self.slots.get_mut(id.0)?;
        let callback = slot.callback.take()?;
        slot.deadline = None;

        Some(CheckedOut {
            callback,
            epoch: slot.epoch,
        })
    }

    /// Returns the callback after it ran. A repeating timer that was not
    /// reset from inside its callback is re-armed `interval` from now.
    pub(crate) fn check_in(&mut self, id: TimerId, checked_out: CheckedOut) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return;
        };

        slot.callback = Some(checked_out.callback);

        if slot.epoch != checked_out.epoch || slot.interval.is_zero() {
            return;
        }

        slot.epoch += 1;
        let deadline = Instant::now() + slot.interval;
        slot.deadline = Some(deadline);
        let epoch = slot.epoch;
        self.push(deadline, id.0, epoch);
    }

    fn push(&mut self, deadline: Instant, key: Key, epoch: u64) {
        self.seq += 1;
        self.heap.push(HeapEntry {
            deadline,
            seq: self.seq,
            key,
            epoch,
        });
        self.compact();
    }

    /// Drops superseded heap entries once they outnumber the timers.
    ///
    /// Each timer has at most one live entry, so past this bound at least half
    /// of the heap is stale and the rebuild is paid for by the resets that
    /// produced it.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.slots.len() + COMPACT_SLACK {
            return;
        }

        let slots = &self.slots;
        self.heap.retain(|entry| entry_is_live(slots, entry));
    }

    fn is_live(&self, entry: &HeapEntry) -> bool {
        entry_is_live(&self.slots, entry)
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}

const COMPACT_SLACK: usize = 16;

fn entry_is_live(slots: &Slab<TimerSlot>, entry: &HeapEntry) -> bool {
    slots
        .get(entry.key)
        .is_some_and(|slot| slot.epoch == entry.epoch && slot.deadline == Some(entry.deadline))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_, _| {})
    }

    #[test]
    fn zero_zero_creates_disarmed_timer() {
        let mut timers = Timers::new();
        let id = timers.insert(Duration::ZERO, Duration::ZERO, noop());

        assert!(timers.contains(id));
        assert!(!timers.is_armed(id));
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn earliest_deadline_pops_first() {
        let mut timers = Timers::new();
        let late = timers.insert(Duration::from_millis(50), Duration::ZERO, noop());
        let early = timers.insert(Duration::from_millis(10), Duration::ZERO, noop());

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(timers.pop_expired(later), Some(early));
        assert_eq!(timers.pop_expired(later), Some(late));
        assert_eq!(timers.pop_expired(later), None);
    }

    #[test]
    fn reset_discards_pending_firing() {
        let mut timers = Timers::new();
        let id = timers.insert(Duration::from_millis(1), Duration::ZERO, noop());

        assert!(timers.reset(id, Duration::from_secs(60), Duration::ZERO));

        let soon = Instant::now() + Duration::from_millis(10);
        assert_eq!(timers.pop_expired(soon), None);
        assert!(timers.is_armed(id));

        assert!(timers.reset(id, Duration::ZERO, Duration::ZERO));
        assert!(!timers.is_armed(id));
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn removed_timer_is_never_popped() {
        let mut timers = Timers::new();
        let id = timers.insert(Duration::ZERO, Duration::from_millis(1), noop());

        assert!(timers.remove(id));
        assert!(!timers.remove(id));
        assert!(!timers.reset(id, Duration::from_millis(1), Duration::ZERO));

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(timers.pop_expired(later), None);
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn repeating_timer_rearms_on_check_in() {
        let mut timers = Timers::new();
        let id = timers.insert(Duration::ZERO, Duration::from_millis(20), noop());

        let now = Instant::now() + Duration::from_millis(1);
        assert_eq!(timers.pop_expired(now), Some(id));

        let checked_out = timers.check_out(id).unwrap();
        assert!(!timers.is_armed(id));
        timers.check_in(id, checked_out);

        assert!(timers.is_armed(id));
        let next = timers.next_deadline().unwrap();
        assert!(next >= now + Duration::from_millis(19));
    }

    #[test]
    fn reset_inside_callback_wins_over_rearm() {
        let mut timers = Timers::new();
        let id = timers.insert(Duration::ZERO, Duration::from_millis(5), noop());

        let now = Instant::now() + Duration::from_millis(1);
        assert_eq!(timers.pop_expired(now), Some(id));

        let checked_out = timers.check_out(id).unwrap();
        timers.reset(id, Duration::ZERO, Duration::ZERO);
        timers.check_in(id, checked_out);

        assert!(!timers.is_armed(id));
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn repeated_resets_keep_the_heap_bounded() {
        let mut timers = Timers::new();
        let heartbeat = timers.insert(Duration::from_secs(1), Duration::ZERO, noop());
        let idle = timers.insert(Duration::from_secs(60), Duration::ZERO, noop());

        for _ in 0..10_000 {
            assert!(timers.reset(idle, Duration::from_secs(60), Duration::ZERO));
            assert!(timers.next_deadline().is_some());
            assert!(timers.heap_len() <= 2 * timers.len() + COMPACT_SLACK + 1);
        }

        let extra = timers.insert(Duration::from_secs(5), Duration::ZERO, noop());
        assert!(timers.remove(extra));
        assert!(timers.heap_len() <= 2 * timers.len() + COMPACT_SLACK + 1);

        assert!(timers.is_armed(heartbeat));
        assert!(timers.is_armed(idle));
        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(timers.pop_expired(later), Some(heartbeat));
        assert_eq!(timers.pop_expired(later), Some(idle));
        assert_eq!(timers.pop_expired(later), None);
    }
}
