//! epoll reactor
//!
//! [`IoManager`] is a scheduler whose idle workers block in `epoll_wait`
//! instead of parking. Fibers (or callbacks) register interest in one
//! direction of a file descriptor with [`IoManager::add_event`]; when the
//! kernel reports readiness the waiter is handed back to its scheduler and
//! the registration is dropped (one-shot).
//!
//! Registrations are edge-triggered. Each fd has a small record holding the
//! armed directions and one waiter per direction, protected by a spinlock.
//! Readiness, cancellation and timeouts all disarm under that lock, so a
//! waiter is triggered at most once.
//!
//! The reactor also owns a [`TimerManager`]. Its earliest deadline bounds
//! the `epoll_wait` timeout, and a timer inserted at the front wakes a
//! blocked worker through a self-pipe.

use crate::config::{self, SchedulerConfig};
use crate::fiber::{Fiber, FiberFn};
use crate::scheduler::{Driver, Scheduler, Task};
use crate::timer::{Timer, TimerManager};
use crate::tls;
use fiberio_core::{kassert, kdebug, kerror, kwarn};
use fiberio_core::{SchedError, SchedResult, SpinLock};
use nix::errno::Errno;
use std::fmt;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

/// epoll user data of the tickle pipe's read end
const TICKLE_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 256;

/// Initial size of the per-fd table
const INITIAL_FDS: usize = 64;

/// Readiness direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// Who to resume when an event fires, and on which scheduler
#[derive(Default)]
struct Waiter {
    sched: Weak<Scheduler>,
    task: Option<Task>,
}

impl Waiter {
    fn trigger(self, fd: RawFd) {
        let Some(task) = self.task else {
            return;
        };
        match self.sched.upgrade() {
            Some(sched) => sched.schedule_task(task, None),
            None => kwarn!("fd {}: scheduler of the waiter is gone, dropping {:?}", fd, task),
        }
    }
}

#[derive(Default)]
struct FdState {
    /// Registered directions (`Event::bits`)
    armed: u32,
    read: Waiter,
    write: Waiter,
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut Waiter {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Disarm `event` and hand back its waiter
    fn take(&mut self, event: Event) -> Waiter {
        self.armed &= !event.bits();
        std::mem::take(self.slot(event))
    }
}

struct FdEvent {
    state: SpinLock<FdState>,
}

/// epoll instance, tickle pipe, fd table and timers behind an [`IoManager`]
pub struct IoReactor {
    epfd: RawFd,
    tickle_rd: RawFd,
    tickle_wr: RawFd,
    fd_events: RwLock<Vec<Arc<FdEvent>>>,
    /// Armed (fd, direction) pairs
    pending: AtomicUsize,
    timers: TimerManager,
    /// Scheduler driven by this reactor, used for waiters registered from
    /// threads that belong to no scheduler
    owner: OnceLock<Weak<Scheduler>>,
}

fn errno() -> i32 {
    Errno::last() as i32
}

impl IoReactor {
    fn new() -> SchedResult<Arc<IoReactor>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            let err = errno();
            kerror!("epoll_create1 failed: errno {}", err);
            return Err(SchedError::Os(err));
        }

        let mut pipe = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let err = errno();
            kerror!("pipe2 failed: errno {}", err);
            unsafe { libc::close(epfd) };
            return Err(SchedError::Os(err));
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: TICKLE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe[0], &mut ev) } != 0 {
            let err = errno();
            kerror!("registering tickle pipe failed: errno {}", err);
            unsafe {
                libc::close(pipe[0]);
                libc::close(pipe[1]);
                libc::close(epfd);
            }
            return Err(SchedError::Os(err));
        }

        let reactor = Arc::new_cyclic(|me: &Weak<IoReactor>| {
            let me = me.clone();
            IoReactor {
                epfd,
                tickle_rd: pipe[0],
                tickle_wr: pipe[1],
                fd_events: RwLock::new((0..INITIAL_FDS).map(|_| Arc::new(FdEvent::new())).collect()),
                pending: AtomicUsize::new(0),
                timers: TimerManager::new(move || {
                    if let Some(reactor) = me.upgrade() {
                        reactor.tickle();
                    }
                }),
                owner: OnceLock::new(),
            }
        });
        kdebug!("reactor epfd={} tickle={}/{}", epfd, pipe[0], pipe[1]);
        Ok(reactor)
    }

    #[inline]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Number of armed (fd, direction) registrations
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// No timers and no armed events
    pub(crate) fn is_quiescent(&self) -> bool {
        self.pending_events() == 0 && !self.timers.has_timer()
    }

    fn fd_event(&self, fd: RawFd, create: bool) -> Option<Arc<FdEvent>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let events = self.fd_events.read().unwrap_or_else(|e| e.into_inner());
            if let Some(e) = events.get(idx) {
                return Some(Arc::clone(e));
            }
        }
        if !create {
            return None;
        }
        let mut events = self.fd_events.write().unwrap_or_else(|e| e.into_inner());
        let want = (idx + 1).max(events.len() * 3 / 2);
        while events.len() < want {
            events.push(Arc::new(FdEvent::new()));
        }
        Some(Arc::clone(&events[idx]))
    }

    /// Point the epoll registration of `fd` at `armed`, removing it when empty
    fn rearm(&self, fd: RawFd, armed: u32) -> SchedResult<()> {
        let op = if armed == 0 { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        self.ctl(op, fd, armed)
    }

    fn ctl(&self, op: i32, fd: RawFd, armed: u32) -> SchedResult<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | armed,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let err = errno();
            kerror!("epoll_ctl(op={}, fd={}, events={:#x}) failed: errno {}", op, fd, armed, err);
            return Err(SchedError::Os(err));
        }
        Ok(())
    }

    fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> SchedResult<()> {
        let task = match cb {
            Some(cb) => Task::Callback(cb),
            None if tls::in_fiber() => Task::Fiber(Fiber::current()),
            None => return Err(SchedError::InvalidState),
        };
        let Some(fd_event) = self.fd_event(fd, true) else {
            return Err(SchedError::Os(libc::EBADF));
        };
        let sched = match Scheduler::current() {
            Some(s) => Arc::downgrade(&s),
            None => self.owner.get().cloned().unwrap_or_default(),
        };

        let mut state = fd_event.state.lock();
        kassert!(
            state.armed & event.bits() == 0,
            "fd {} already has {:?} armed (events {:#x})",
            fd,
            event,
            state.armed
        );
        let op = if state.armed == 0 { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        self.ctl(op, fd, state.armed | event.bits())?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.armed |= event.bits();
        *state.slot(event) = Waiter {
            sched,
            task: Some(task),
        };
        Ok(())
    }

    fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_event) = self.fd_event(fd, false) else {
            return false;
        };
        let mut state = fd_event.state.lock();
        if state.armed & event.bits() == 0 {
            return false;
        }
        if self.rearm(fd, state.armed & !event.bits()).is_err() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
        drop(state.take(event));
        true
    }

    /// See [`IoManager::cancel_event_with`]
    pub fn cancel_event_with<F>(&self, fd: RawFd, event: Event, on_cancel: F) -> bool
    where
        F: FnOnce(),
    {
        let Some(fd_event) = self.fd_event(fd, false) else {
            return false;
        };
        let waiter = {
            let mut state = fd_event.state.lock();
            if state.armed & event.bits() == 0 {
                return false;
            }
            on_cancel();
            if self.rearm(fd, state.armed & !event.bits()).is_err() {
                return false;
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
            state.take(event)
        };
        waiter.trigger(fd);
        true
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_event) = self.fd_event(fd, false) else {
            return false;
        };
        let mut fired = Vec::with_capacity(2);
        {
            let mut state = fd_event.state.lock();
            if state.armed == 0 {
                return false;
            }
            if self.rearm(fd, 0).is_err() {
                return false;
            }
            for event in [Event::Read, Event::Write] {
                if state.armed & event.bits() != 0 {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    fired.push(state.take(event));
                }
            }
        }
        for waiter in fired {
            waiter.trigger(fd);
        }
        true
    }

    /// Wake one worker blocked in `epoll_wait`
    pub(crate) fn tickle(&self) {
        let rc = unsafe { libc::write(self.tickle_wr, b"T".as_ptr() as *const libc::c_void, 1) };
        if rc != 1 {
            let err = errno();
            // A full pipe already guarantees a wake-up
            if err != libc::EAGAIN {
                kwarn!("tickle write failed: errno {}", err);
            }
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        while unsafe { libc::read(self.tickle_rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } > 0 {}
    }

    /// Handle one epoll result for `fd`
    fn dispatch(&self, fd: RawFd, mut bits: u32) {
        let Some(fd_event) = self.fd_event(fd, false) else {
            return;
        };
        let mut fired = Vec::with_capacity(2);
        {
            let mut state = fd_event.state.lock();
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.armed;
            }
            let ready = bits & state.armed & (Event::Read.bits() | Event::Write.bits());
            if ready == 0 {
                return;
            }
            if self.rearm(fd, state.armed & !ready).is_err() {
                return;
            }
            for event in [Event::Read, Event::Write] {
                if ready & event.bits() != 0 {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    fired.push(state.take(event));
                }
            }
        }
        for waiter in fired {
            waiter.trigger(fd);
        }
    }

    /// Idle fiber body of a reactor-driven worker
    pub(crate) fn idle(&self, sched: &Scheduler) {
        let empty = libc::epoll_event { events: 0, u64: 0 };
        let mut events = vec![empty; MAX_EVENTS];

        loop {
            let next = self.timers.next_timeout();
            if sched.stopping() {
                kdebug!("reactor idle exits, scheduler '{}' stopping", sched.name());
                // Pass the wake-up on to workers still blocked in epoll_wait
                self.tickle();
                break;
            }

            let max = config::reactor_max_timeout().get();
            let timeout = next.map_or(max, |n| n.min(max)).min(i32::MAX as u64) as i32;
            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = errno();
                if err != libc::EINTR {
                    kerror!("epoll_wait failed: errno {}", err);
                    break 0;
                }
            };

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                sched.schedule_batch(expired.into_iter().map(|cb| Task::callback(move || cb())));
            }

            for ev in &events[..n] {
                let token = ev.u64;
                let bits = ev.events;
                if token == TICKLE_TOKEN {
                    self.drain_tickle();
                } else {
                    self.dispatch(token as RawFd, bits);
                }
            }

            Fiber::yield_to_hold();
        }
    }
}

impl FdEvent {
    fn new() -> Self {
        Self {
            state: SpinLock::new(FdState::default()),
        }
    }
}

impl Drop for IoReactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_rd);
            libc::close(self.tickle_wr);
            libc::close(self.epfd);
        }
    }
}

impl fmt::Debug for IoReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoReactor")
            .field("epfd", &self.epfd)
            .field("pending", &self.pending_events())
            .field("timers", &self.timers.len())
            .finish()
    }
}

/// A started scheduler driven by an epoll reactor
///
/// Cloning yields another handle to the same manager. Dereferences to
/// [`Scheduler`] for scheduling and `stop()`.
#[derive(Clone)]
pub struct IoManager {
    sched: Arc<Scheduler>,
    reactor: Arc<IoReactor>,
}

impl IoManager {
    /// Create the reactor and start its workers
    pub fn new(config: SchedulerConfig) -> SchedResult<IoManager> {
        let reactor = IoReactor::new()?;
        let sched = Scheduler::with_driver(config, Driver::Reactor(Arc::clone(&reactor)))?;
        let _ = reactor.owner.set(Arc::downgrade(&sched));
        sched.start()?;
        Ok(IoManager { sched, reactor })
    }

    /// The manager whose scheduler runs the calling thread
    pub fn current() -> Option<IoManager> {
        let sched = Scheduler::current()?;
        let reactor = match sched.driver() {
            Driver::Reactor(reactor) => Arc::clone(reactor),
            Driver::Cooperative(_) => return None,
        };
        Some(IoManager { sched, reactor })
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    #[inline]
    pub fn reactor(&self) -> &Arc<IoReactor> {
        &self.reactor
    }

    /// Arm `event` on `fd`
    ///
    /// When the event fires, `cb` is scheduled, or with `None` the calling
    /// fiber is resumed (it should `Fiber::yield_to_hold()` right after).
    /// `None` outside a fiber fails with `InvalidState`. Arming a direction
    /// that is already armed is a fatal error.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> SchedResult<()> {
        self.reactor.add_event(fd, event, cb)
    }

    /// Disarm `event` on `fd` without running its waiter
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.del_event(fd, event)
    }

    /// Disarm `event` on `fd` and run its waiter now
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.cancel_event_with(fd, event, || {})
    }

    /// Like [`cancel_event`](Self::cancel_event), running `on_cancel` first
    /// only if the event was still armed
    ///
    /// `on_cancel` runs under the fd's lock, so it cannot interleave with a
    /// readiness notification for the same fd.
    pub fn cancel_event_with<F>(&self, fd: RawFd, event: Event, on_cancel: F) -> bool
    where
        F: FnOnce(),
    {
        self.reactor.cancel_event_with(fd, event, on_cancel)
    }

    /// Disarm both directions of `fd`, running their waiters
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel_all(fd)
    }

    pub fn pending_events(&self) -> usize {
        self.reactor.pending_events()
    }

    #[inline]
    pub fn timers(&self) -> &TimerManager {
        &self.reactor.timers
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, W>(&self, ms: u64, cb: F, cond: Weak<W>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        W: ?Sized + Send + Sync + 'static,
    {
        self.reactor.timers.add_condition_timer(ms, cb, cond, recurring)
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("sched", &self.sched)
            .field("reactor", &self.reactor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn iomanager(name: &str, threads: usize) -> IoManager {
        IoManager::new(SchedulerConfig::new().name(name).threads(threads)).unwrap()
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn write_byte(fd: RawFd) {
        assert_eq!(unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_timer_fires_once() {
        let iom = iomanager("timer", 1);
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        let tx = std::sync::Mutex::new(tx);
        iom.add_timer(100, move || { let _ = tx.lock().unwrap().send(Instant::now()); }, false);

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(90));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        iom.stop();
    }

    #[test]
    fn test_stop_waits_for_timers() {
        let iom = iomanager("stopwait", 2);
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        iom.add_timer(50, move || f.store(true, Ordering::SeqCst), false);
        iom.stop();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_read_event_fires_once() {
        let iom = iomanager("readev", 1);
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        iom.add_event(a, Event::Read, Some(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); })))
            .unwrap();
        assert_eq!(iom.pending_events(), 1);

        write_byte(b);
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_events(), 0);
        assert!(!iom.del_event(a, Event::Read));

        write_byte(b);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        iom.stop();
        close(a);
        close(b);
    }

    #[test]
    fn test_del_does_not_fire_cancel_does() {
        let iom = iomanager("cancel", 1);
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        iom.add_event(a, Event::Read, Some(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); })))
            .unwrap();
        assert!(iom.del_event(a, Event::Read));
        assert!(!iom.del_event(a, Event::Read));
        assert_eq!(iom.pending_events(), 0);

        let h = Arc::clone(&hits);
        iom.add_event(a, Event::Read, Some(Box::new(move || { h.fetch_add(10, Ordering::SeqCst); })))
            .unwrap();
        let ran = AtomicBool::new(false);
        assert!(iom.cancel_event_with(a, Event::Read, || ran.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
        assert!(!iom.cancel_event(a, Event::Read));

        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        close(a);
        close(b);
    }

    #[test]
    fn test_cancel_all_fires_both_directions() {
        let iom = iomanager("cancelall", 1);
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));
        for event in [Event::Read, Event::Write] {
            let h = Arc::clone(&hits);
            // Fill the send buffer first so Write stays armed
            if event == Event::Write {
                while unsafe { libc::write(a, [0u8; 4096].as_ptr() as *const libc::c_void, 4096) } > 0 {}
            }
            iom.add_event(a, event, Some(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); })))
                .unwrap();
        }
        assert_eq!(iom.pending_events(), 2);
        assert!(iom.cancel_all(a));
        assert!(!iom.cancel_all(a));
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        close(a);
        close(b);
    }

    #[test]
    fn test_double_arm_is_fatal() {
        const CHILD_ENV: &str = "FIBERIO_DOUBLE_ARM_CHILD";
        if std::env::var_os(CHILD_ENV).is_some() {
            let iom = iomanager("doublearm", 1);
            let (a, _b) = socketpair();
            iom.add_event(a, Event::Read, Some(Box::new(|| {}))).unwrap();
            let _ = iom.add_event(a, Event::Read, Some(Box::new(|| {})));
            unreachable!("second arm returned");
        }

        // Re-run only this test in a child process, which has to abort
        let exe = std::env::current_exe().unwrap();
        let out = std::process::Command::new(exe)
            .args(["--exact", "reactor::tests::test_double_arm_is_fatal", "--nocapture", "--test-threads=1"])
            .env(CHILD_ENV, "1")
            .output()
            .unwrap();

        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(!out.status.success());
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(out.status.signal(), Some(libc::SIGABRT), "stderr: {}", stderr);
        }
        assert!(stderr.contains("FATAL: assertion failed"), "stderr: {}", stderr);
        assert!(stderr.contains("already has Read armed"), "stderr: {}", stderr);
        assert!(!stderr.contains("second arm returned"));
    }

    #[test]
    fn test_readiness_racing_cancel_fires_once() {
        let iom = iomanager("race", 3);
        let mut counters = Vec::new();

        for _ in 0..300 {
            let (a, b) = socketpair();
            let hits = Arc::new(AtomicUsize::new(0));
            let h = Arc::clone(&hits);
            iom.add_event(a, Event::Read, Some(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); })))
                .unwrap();

            let writer = std::thread::spawn(move || write_byte(b));
            let cancelled = iom.cancel_event(a, Event::Read);
            writer.join().unwrap();

            let deadline = Instant::now() + Duration::from_secs(2);
            while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
                std::thread::yield_now();
            }
            assert_eq!(hits.load(Ordering::SeqCst), 1, "cancelled={}", cancelled);
            assert!(!iom.cancel_event(a, Event::Read));
            close(a);
            close(b);
            counters.push(hits);
        }

        std::thread::sleep(Duration::from_millis(50));
        iom.stop();
        assert_eq!(iom.pending_events(), 0);
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_use_caller_restores_hook_flag() {
        let (caller_flag, task_flag) = std::thread::spawn(|| {
            tls::set_hook_enable(false);
            let iom = IoManager::new(SchedulerConfig::new().name("callerhook").threads(1).use_caller(true)).unwrap();
            let seen = Arc::new(AtomicBool::new(false));
            let s = Arc::clone(&seen);
            iom.schedule(move || s.store(tls::is_hook_enable(), Ordering::SeqCst));
            iom.stop();
            (tls::is_hook_enable(), seen.load(Ordering::SeqCst))
        })
        .join()
        .unwrap();

        assert!(!caller_flag);
        assert_eq!(task_flag, tls::hook_default());
    }

    #[test]
    fn test_add_event_outside_fiber_needs_callback() {
        let iom = iomanager("nofiber", 1);
        let (a, b) = socketpair();
        assert_eq!(iom.add_event(a, Event::Read, None), Err(SchedError::InvalidState));
        assert_eq!(iom.pending_events(), 0);
        iom.stop();
        close(a);
        close(b);
    }

    #[test]
    fn test_fiber_waits_for_readiness() {
        let iom = iomanager("fiberwait", 2);
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let iom = IoManager::current().unwrap();
            iom.add_event(a, Event::Read, None).unwrap();
            Fiber::yield_to_hold();
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            let _ = tx.send(n);
        });

        std::thread::sleep(Duration::from_millis(30));
        write_byte(b);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        iom.stop();
        close(a);
        close(b);
    }

    #[test]
    fn test_hangup_wakes_reader() {
        let iom = iomanager("hup", 1);
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        iom.add_event(a, Event::Read, Some(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); })))
            .unwrap();
        close(b);
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        close(a);
    }

    #[test]
    fn test_current_matches_reactor_only() {
        let iom = iomanager("current", 1);
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let _ = tx.send(IoManager::current().is_some() && tls::is_hook_enable());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert!(IoManager::current().is_none());
        iom.stop();

        let sched = Scheduler::new(SchedulerConfig::new().name("coop")).unwrap();
        sched.start().unwrap();
        let (tx, rx) = mpsc::channel();
        sched.schedule(move || {
            let _ = tx.send(IoManager::current().is_none() && Scheduler::current().is_some());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        sched.stop();
    }
}
