//! One-shot timers and the clock they run against.

use crate::value::{Arena, ClosureId, TimerId};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Monotonic time source for timers and `now`.
pub trait Clock: Send {
    /// Time elapsed since the clock started.
    fn now(&self) -> Duration;

    /// Block until `deadline` has passed.
    fn wait_until(&mut self, deadline: Duration);
}

#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn wait_until(&mut self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Virtual clock that jumps straight to the requested deadline.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Duration,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now
    }

    fn wait_until(&mut self, deadline: Duration) {
        self.now = self.now.max(deadline);
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerRecord {
    closure: ClosureId,
    deadline: Duration,
}

pub struct TimerQueue {
    timers: Arena<TimerId, TimerRecord>,
    heap: BinaryHeap<Reverse<(Duration, u64, TimerId)>>,
    seq: u64,
    clock: Box<dyn Clock>,
}

impl TimerQueue {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            timers: Arena::new(),
            heap: BinaryHeap::new(),
            seq: 0,
            clock,
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Milliseconds since start, as reported by the `now` import.
    pub fn now_ms(&self) -> f64 {
        self.clock.now().as_secs_f64() * 1000.0
    }

    /// Fire `closure` after `delay_ms`. Negative and non-finite delays mean
    /// "as soon as possible".
    pub fn schedule(&mut self, closure: ClosureId, delay_ms: f64) -> TimerId {
        let delay = if delay_ms.is_finite() && delay_ms > 0.0 {
            Duration::from_nanos((delay_ms * 1_000_000.0) as u64)
        } else {
            Duration::ZERO
        };
        let deadline = self.clock.now() + delay;
        let id = self.timers.insert(TimerRecord { closure, deadline });
        // Equal deadlines fire in scheduling order.
        self.seq += 1;
        self.heap.push(Reverse((deadline, self.seq, id)));
        tracing::trace!(timer = %id, ?deadline, "timer scheduled");
        id
    }

    /// Cancel a pending timer; false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(id).is_some()
    }

    pub fn has_pending(&self) -> bool {
        !self.timers.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, _, id))) = self.heap.peek() {
            if self.timers.contains(*id) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop the earliest timer whose deadline has passed.
    pub fn pop_due(&mut self) -> Option<(TimerId, ClosureId)> {
        let deadline = self.next_deadline()?;
        if deadline > self.clock.now() {
            return None;
        }
        let Reverse((_, _, id)) = self.heap.pop()?;
        let record = self.timers.remove(id)?;
        Some((id, record.closure))
    }

    /// Wait for the earliest pending timer. Returns false if there is none.
    /// Sleep for `limit`, or until the next timer is due if that is sooner.
    pub fn wait_at_most(&mut self, limit: Duration) {
        let cap = self.clock.now() + limit;
        let deadline = self.next_deadline().map_or(cap, |next| next.min(cap));
        self.clock.wait_until(deadline);
    }

    pub fn wait_for_next(&mut self) -> bool {
        match self.next_deadline() {
            Some(deadline) => {
                self.clock.wait_until(deadline);
                true
            }
            None => false,
        }
    }
}
