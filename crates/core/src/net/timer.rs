use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use super::TaskScheduler;

/// Timer callback. Returning `true` re-arms the timer for another interval.
pub type TimerEvent = Box<dyn FnMut(&TaskScheduler) -> bool + Send + 'static>;

/// Identifier returned by [`TimerQueue::add_timer`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Timer {
    interval: Duration,
    deadline: Instant,
    // None while the callback is running on the scheduler thread.
    event: Option<TimerEvent>,
}

/// Deadline-ordered timer set, shared between a scheduler and its handles.
#[derive(Default)]
pub struct TimerQueue {
    next_id: u64,
    timers: HashMap<TimerId, Timer>,
    schedule: BTreeSet<(Instant, TimerId)>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_timer(&mut self, interval: Duration, event: TimerEvent) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let deadline = Instant::now() + interval;
        self.timers.insert(
            id,
            Timer {
                interval,
                deadline,
                event: Some(event),
            },
        );
        self.schedule.insert((deadline, id));
        id
    }

    /// Cancel a timer. Safe to call from inside the timer's own callback.
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(timer) => {
                self.schedule.remove(&(timer.deadline, id));
                true
            }
            None => false,
        }
    }

    /// Time until the earliest deadline, zero if already due, `None` if empty.
    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        self.schedule
            .first()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Detach the callbacks of every timer due at `now`, earliest first.
    /// The entries stay registered so a concurrent removal is still seen by
    /// [`restore`](Self::restore).
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(TimerId, TimerEvent)> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.schedule.first() {
            if deadline > now {
                break;
            }
            self.schedule.pop_first();
            if let Some(event) = self.timers.get_mut(&id).and_then(|t| t.event.take()) {
                expired.push((id, event));
            }
        }
        expired
    }

    /// Hand a fired callback back. Repeating timers are re-armed from `now`;
    /// one-shot or removed timers are dropped.
    pub(crate) fn restore(&mut self, id: TimerId, event: TimerEvent, repeat: bool, now: Instant) {
        if !repeat {
            self.timers.remove(&id);
            return;
        }
        if let Some(timer) = self.timers.get_mut(&id) {
            timer.deadline = now + timer.interval;
            timer.event = Some(event);
            self.schedule.insert((timer.deadline, id));
        }
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("timers", &self.timers.len())
            .field("next_deadline", &self.schedule.first().map(|(d, _)| *d))
            .finish()
    }
}
