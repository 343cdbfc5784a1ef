//! Timer entries and the user-facing handle

use super::Inner;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

/// Callback run when a timer expires
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A wall clock going back by more than this is treated as a rollover
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

pub(super) struct TimerEntry {
    pub(super) ms: u64,
    pub(super) recurring: bool,
    pub(super) cb: TimerCallback,
}

/// Pending timers ordered by `(deadline, id)`
///
/// The id breaks ties, so timers sharing a deadline fire in creation order.
pub(super) struct TimerSet {
    by_deadline: BTreeMap<(u64, u64), TimerEntry>,
    deadlines: HashMap<u64, u64>,
    previous_ms: u64,
}

impl TimerSet {
    pub(super) fn new(now: u64) -> Self {
        Self {
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
            previous_ms: now,
        }
    }

    /// Insert and report whether the timer became the earliest one
    pub(super) fn insert(&mut self, id: u64, deadline: u64, entry: TimerEntry) -> bool {
        self.by_deadline.insert((deadline, id), entry);
        self.deadlines.insert(id, deadline);
        self.by_deadline.keys().next() == Some(&(deadline, id))
    }

    pub(super) fn remove(&mut self, id: u64) -> Option<(u64, TimerEntry)> {
        let deadline = self.deadlines.remove(&id)?;
        self.by_deadline.remove(&(deadline, id)).map(|e| (deadline, e))
    }

    pub(super) fn first_deadline(&self) -> Option<u64> {
        self.by_deadline.keys().next().map(|&(deadline, _)| deadline)
    }

    pub(super) fn len(&self) -> usize {
        self.by_deadline.len()
    }

    /// Remove every timer due at `now`, re-arming recurring ones
    ///
    /// After a backward jump of the clock larger than an hour every timer
    /// is considered due.
    pub(super) fn take_expired(&mut self, now: u64) -> Vec<TimerCallback> {
        let rollover = now < self.previous_ms.saturating_sub(ROLLOVER_MS);
        self.previous_ms = now;

        match self.first_deadline() {
            None => return Vec::new(),
            Some(first) if !rollover && first > now => return Vec::new(),
            Some(_) => {}
        }

        let expired = if rollover {
            std::mem::take(&mut self.by_deadline)
        } else {
            let rest = self.by_deadline.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut self.by_deadline, rest)
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for ((_, id), entry) in expired {
            cbs.push(Arc::clone(&entry.cb));
            if entry.recurring {
                let next = next_deadline(entry.ms, now);
                self.by_deadline.insert((next, id), entry);
                self.deadlines.insert(id, next);
            } else {
                self.deadlines.remove(&id);
            }
        }
        cbs
    }
}

/// Next deadline of a recurring timer fired at `now`
///
/// Counted from the firing time, so two firings are never closer than one
/// period. A late firing shifts the phase and missed periods are dropped.
/// After a clock rollover the old deadline is ignored the same way.
pub(super) fn next_deadline(period: u64, now: u64) -> u64 {
    now.saturating_add(period.max(1))
}

/// Handle to a timer registered with a [`TimerManager`](super::TimerManager)
///
/// Dropping the handle does not cancel the timer. Operations on a timer
/// that already fired (one-shot) or was cancelled return `false`.
#[derive(Clone)]
pub struct Timer {
    pub(super) id: u64,
    pub(super) inner: Weak<Inner>,
}

impl Timer {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the timer without running it
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let removed = inner.write().remove(self.id).is_some();
        removed
    }

    /// Push the deadline to `now + period`
    pub fn refresh(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let now = inner.clock.now_ms();
        let mut set = inner.write();
        let Some((_, entry)) = set.remove(self.id) else {
            return false;
        };
        let deadline = now.saturating_add(entry.ms);
        set.insert(self.id, deadline, entry);
        true
    }

    /// Change the period to `ms`
    ///
    /// The new deadline counts from now if `from_now`, otherwise from the
    /// start of the current period.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let now = inner.clock.now_ms();
        let at_front = {
            let mut set = inner.write();
            let Some((deadline, mut entry)) = set.remove(self.id) else {
                return false;
            };
            if ms == entry.ms && !from_now {
                set.insert(self.id, deadline, entry);
                return true;
            }
            let start = if from_now { now } else { deadline.saturating_sub(entry.ms) };
            entry.ms = ms;
            set.insert(self.id, start.saturating_add(ms), entry)
        };
        if at_front {
            inner.notify_front();
        }
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_deadline_on_time() {
        assert_eq!(next_deadline(100, 100), 200);
    }

    #[test]
    fn test_late_firing_keeps_full_period() {
        assert_eq!(next_deadline(100, 130), 230);
        assert_eq!(next_deadline(100, 350), 450);
    }

    #[test]
    fn test_next_deadline_after_clock_went_back() {
        assert_eq!(next_deadline(100, 5_000), 5_100);
    }

    #[test]
    fn test_zero_period_still_advances() {
        assert_eq!(next_deadline(0, 100), 101);
    }
}
