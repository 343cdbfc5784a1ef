//! Deadline-ordered timers
//!
//! A [`TimerManager`] keeps one-shot and recurring timers sorted by
//! deadline. It does not run anything itself: its owner asks for the time
//! until the next deadline ([`TimerManager::next_timeout`]), sleeps at most
//! that long, then collects the due callbacks
//! ([`TimerManager::list_expired`]) and runs them.
//!
//! When a new timer becomes the earliest one, the owner's `on_front` hook
//! is invoked so that a sleeping owner can shorten its wait. The hook fires
//! at most once between two `next_timeout` calls.
//!
//! ```text
//!   add_timer ──► TimerSet (BTreeMap<(deadline, id)>) ──► list_expired
//!       │                                                     │
//!       └── new earliest? ── on_front() ──► owner wakes ──────┘
//! ```

mod clock;
mod entry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{Timer, TimerCallback};

use entry::{TimerEntry, TimerSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

struct Inner {
    set: RwLock<TimerSet>,
    /// Set once `on_front` ran, cleared by `next_timeout`
    tickled: AtomicBool,
    clock: Arc<dyn Clock>,
    on_front: Box<dyn Fn() + Send + Sync>,
    next_id: AtomicU64,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, TimerSet> {
        self.set.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TimerSet> {
        self.set.write().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_front(&self) {
        if !self.tickled.swap(true, Ordering::AcqRel) {
            (self.on_front)();
        }
    }
}

/// Set of pending timers owned by a reactor (or any polling loop)
pub struct TimerManager {
    inner: Arc<Inner>,
}

impl TimerManager {
    /// Timers on the wall clock
    pub fn new<F>(on_front: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::with_clock(Arc::new(SystemClock), on_front)
    }

    pub fn with_clock<F>(clock: Arc<dyn Clock>, on_front: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let now = clock.now_ms();
        Self {
            inner: Arc::new(Inner {
                set: RwLock::new(TimerSet::new(now)),
                tickled: AtomicBool::new(false),
                clock,
                on_front: Box::new(on_front),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Run `cb` after `ms` milliseconds, and every `ms` after that if `recurring`
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add(ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` only runs while `cond`
    /// can still be upgraded
    pub fn add_condition_timer<F, W>(&self, ms: u64, cb: F, cond: Weak<W>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        W: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn add(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = inner.clock.now_ms().saturating_add(ms);
        let at_front = inner.write().insert(id, deadline, TimerEntry { ms, recurring, cb });
        if at_front {
            inner.notify_front();
        }
        Timer {
            id,
            inner: Arc::downgrade(inner),
        }
    }

    /// Milliseconds until the earliest deadline
    ///
    /// `None` with no timers, `Some(0)` if one is already due. Re-enables
    /// the `on_front` hook.
    pub fn next_timeout(&self) -> Option<u64> {
        self.inner.tickled.store(false, Ordering::Release);
        let first = self.inner.read().first_deadline()?;
        Some(first.saturating_sub(self.inner.clock.now_ms()))
    }

    /// Remove and return the callbacks of every due timer, earliest first
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = self.inner.clock.now_ms();
        if self.inner.read().len() == 0 {
            return Vec::new();
        }
        let expired = self.inner.write().take_expired(now);
        expired
    }

    pub fn has_timer(&self) -> bool {
        self.inner.read().len() > 0
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const HOUR: u64 = 60 * 60 * 1000;

    fn manual(start: u64) -> (Arc<ManualClock>, TimerManager) {
        let clock = Arc::new(ManualClock::new(start));
        let mgr = TimerManager::with_clock(clock.clone(), || {});
        (clock, mgr)
    }

    fn run_all(cbs: Vec<TimerCallback>) {
        for cb in cbs {
            cb();
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> impl Fn() + Send + Sync + 'static {
        let log = Arc::clone(log);
        move || log.lock().unwrap().push(tag)
    }

    #[test]
    fn test_empty_manager() {
        let (_, mgr) = manual(10 * HOUR);
        assert_eq!(mgr.next_timeout(), None);
        assert!(mgr.list_expired().is_empty());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_timeout_counts_down() {
        let (clock, mgr) = manual(10 * HOUR);
        mgr.add_timer(100, || {}, false);
        assert_eq!(mgr.next_timeout(), Some(100));
        clock.advance(60);
        assert_eq!(mgr.next_timeout(), Some(40));
        clock.advance(100);
        assert_eq!(mgr.next_timeout(), Some(0));
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let (clock, mgr) = manual(10 * HOUR);
        let log = Arc::new(Mutex::new(Vec::new()));
        mgr.add_timer(30, recorder(&log, "c"), false);
        mgr.add_timer(10, recorder(&log, "a"), false);
        mgr.add_timer(20, recorder(&log, "b1"), false);
        mgr.add_timer(20, recorder(&log, "b2"), false);
        mgr.add_timer(500, recorder(&log, "late"), false);

        clock.advance(5);
        assert!(mgr.list_expired().is_empty());
        clock.advance(25);
        run_all(mgr.list_expired());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b1", "b2", "c"]);
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.next_timeout(), Some(470));
    }

    #[test]
    fn test_cancel() {
        let (clock, mgr) = manual(10 * HOUR);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = mgr.add_timer(10, move || { h.fetch_add(1, Ordering::SeqCst); }, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        clock.advance(20);
        run_all(mgr.list_expired());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let (clock, mgr) = manual(10 * HOUR);
        let timer = mgr.add_timer(10, || {}, false);
        clock.advance(10);
        assert_eq!(mgr.list_expired().len(), 1);
        clock.advance(10);
        assert!(mgr.list_expired().is_empty());
        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(5, true));
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let (clock, mgr) = manual(10 * HOUR);
        let timer = mgr.add_timer(100, || {}, false);
        clock.advance(80);
        assert!(timer.refresh());
        assert_eq!(mgr.next_timeout(), Some(100));
        clock.advance(99);
        assert!(mgr.list_expired().is_empty());
        clock.advance(1);
        assert_eq!(mgr.list_expired().len(), 1);
    }

    #[test]
    fn test_reset_from_now_and_from_start() {
        let (clock, mgr) = manual(10 * HOUR);
        let timer = mgr.add_timer(100, || {}, false);
        clock.advance(40);

        assert!(timer.reset(100, false));
        assert_eq!(mgr.next_timeout(), Some(60));

        assert!(timer.reset(50, false));
        assert_eq!(mgr.next_timeout(), Some(10));

        assert!(timer.reset(50, true));
        assert_eq!(mgr.next_timeout(), Some(50));
    }

    #[test]
    fn test_condition_timer_skipped_when_guard_gone() {
        let (clock, mgr) = manual(10 * HOUR);
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = Arc::new(());

        let h = Arc::clone(&hits);
        mgr.add_condition_timer(10, move || { h.fetch_add(1, Ordering::SeqCst); }, Arc::downgrade(&guard), false);
        let h = Arc::clone(&hits);
        let dead = Arc::new(());
        mgr.add_condition_timer(10, move || { h.fetch_add(100, Ordering::SeqCst); }, Arc::downgrade(&dead), false);
        drop(dead);

        clock.advance(10);
        let cbs = mgr.list_expired();
        assert_eq!(cbs.len(), 2);
        run_all(cbs);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recurring_firings_are_a_full_period_apart() {
        let (clock, mgr) = manual(10 * HOUR);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = mgr.add_timer(100, move || { h.fetch_add(1, Ordering::SeqCst); }, true);

        // Collected 30ms late: the next firing is still 100ms away
        clock.advance(130);
        run_all(mgr.list_expired());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.next_timeout(), Some(100));

        clock.advance(99);
        assert!(mgr.list_expired().is_empty());
        clock.advance(1);
        run_all(mgr.list_expired());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Several periods late: one callback, missed periods are dropped
        clock.advance(350);
        run_all(mgr.list_expired());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(mgr.next_timeout(), Some(100));

        assert!(timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_clock_rollover_fires_everything() {
        let (clock, mgr) = manual(10 * HOUR);
        let log = Arc::new(Mutex::new(Vec::new()));
        mgr.add_timer(1000, recorder(&log, "soon"), false);
        mgr.add_timer(5 * HOUR, recorder(&log, "later"), false);

        clock.set(8 * HOUR);
        run_all(mgr.list_expired());
        assert_eq!(*log.lock().unwrap(), vec!["soon", "later"]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_small_backward_jump_is_not_rollover() {
        let (clock, mgr) = manual(10 * HOUR);
        mgr.add_timer(1000, || {}, false);
        clock.set(10 * HOUR - 30 * 60 * 1000);
        assert!(mgr.list_expired().is_empty());
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_front_notification_is_deduplicated() {
        let clock = Arc::new(ManualClock::new(10 * HOUR));
        let fronts = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fronts);
        let mgr = TimerManager::with_clock(clock, move || { f.fetch_add(1, Ordering::SeqCst); });

        mgr.add_timer(100, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 1);
        mgr.add_timer(50, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 1);

        mgr.next_timeout();
        mgr.add_timer(500, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 1);
        mgr.add_timer(10, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handle_outlives_manager() {
        let (_, mgr) = manual(10 * HOUR);
        let timer = mgr.add_timer(10, || {}, false);
        drop(mgr);
        assert!(!timer.cancel());
        assert!(!timer.refresh());
    }
}
