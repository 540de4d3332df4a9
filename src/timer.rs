//! One-shot timer service.
//!
//! Every deferred action of the device (bus dispatch, IP acquisition timeout,
//! deferred disconnects and server shutdown) is a task sitting in this queue.
//! Tasks never run from inside the call that scheduled them; they are handed
//! out by [`TimerService::pop_due`] once the clock has passed their deadline,
//! which is what keeps calls into the network stack out of its own callbacks.

use std::{
    cell::Cell,
    collections::BTreeMap,
    fmt,
    rc::Rc,
    time::{Duration, Instant},
};

/// Monotonic time since boot.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`], counting from construction.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }

    /// The instant a duration since boot corresponds to.
    pub fn instant_at(&self, since_boot: Duration) -> Instant {
        self.boot + since_boot
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.boot.elapsed()
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    pub fn set(&self, now: Duration) {
        self.0.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.0.get()
    }
}

/// Identifies one armed timer. Stale handles are harmless.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle {
    deadline: Duration,
    seq: u64,
}

impl TimerHandle {
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// Queue of one-shot tasks ordered by expiry, then by scheduling order.
pub struct TimerService<T> {
    clock: Box<dyn Clock>,
    queue: BTreeMap<TimerHandle, T>,
    next_seq: u64,
}

impl<T> TimerService<T> {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            clock,
            queue: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Arm a one-shot timer firing `delay` from now.
    pub fn schedule(&mut self, delay: Duration, task: T) -> TimerHandle {
        let handle = TimerHandle {
            deadline: self.now() + delay,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queue.insert(handle, task);
        handle
    }

    /// Disarm a timer, returning its task if it had not fired yet.
    pub fn disarm(&mut self, handle: TimerHandle) -> Option<T> {
        self.queue.remove(&handle)
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.queue.contains_key(&handle)
    }

    /// Move a pending timer to fire `delay` from now.
    pub fn reschedule(&mut self, handle: TimerHandle, delay: Duration) -> Option<TimerHandle> {
        let task = self.disarm(handle)?;
        Some(self.schedule(delay, task))
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.keys().next().map(TimerHandle::deadline)
    }

    /// Take the earliest task whose deadline has passed.
    pub fn pop_due(&mut self) -> Option<T> {
        let now = self.now();
        let (handle, _) = self.queue.first_key_value()?;
        if handle.deadline > now {
            return None;
        }
        self.queue.pop_first().map(|(_, task)| task)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Disarm every task for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.queue.retain(|_, task| keep(task));
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for TimerService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("now", &self.now())
            .field("queue", &self.queue)
            .finish()
    }
}
