//! N:M fiber scheduler
//!
//! A [`Scheduler`] owns a FIFO run queue of fibers and callbacks that a pool
//! of worker threads drains. Each worker runs the same loop on its own
//! thread-main fiber:
//!
//! 1. take the first runnable entry (skipping entries pinned to another
//!    thread and fibers still executing elsewhere),
//! 2. switch into it, and re-queue it if it yielded READY,
//! 3. with nothing runnable, switch into the thread's idle fiber.
//!
//! What idling means depends on the [`Driver`]: a cooperative scheduler
//! parks on a futex, a reactor-backed one blocks in `epoll_wait`.
//!
//! With `use_caller` the constructing thread takes part too. Its loop runs
//! on a dedicated root fiber that `stop()` drives to completion.

use crate::config::SchedulerConfig;
use crate::fiber::{Fiber, FiberFn};
use crate::parking::{new_parking, WorkerParking};
use crate::reactor::IoReactor;
use crate::tls;
use crate::worker::WorkerPool;
use fiberio_core::{kassert, kdebug, kinfo, kwarn};
use fiberio_core::{FiberState, SchedError, SchedResult};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

/// A unit of work in the run queue
pub enum Task {
    /// Resume an existing fiber
    Fiber(Arc<Fiber>),
    /// Run a closure on a fiber borrowed from the worker
    Callback(FiberFn),
}

impl Task {
    pub fn callback<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => write!(f, "Task::Fiber({})", fiber.id()),
            Task::Callback(_) => write!(f, "Task::Callback"),
        }
    }
}

struct RunEntry {
    task: Task,
    /// Kernel thread id the entry is pinned to
    thread: Option<i32>,
}

/// How idle workers wait and how they are woken
pub(crate) enum Driver {
    /// Park on a futex between queue checks
    Cooperative(Box<dyn WorkerParking>),
    /// Block in the reactor's `epoll_wait`
    Reactor(Arc<IoReactor>),
}

/// Multi-threaded fiber scheduler
pub struct Scheduler {
    name: String,
    config: SchedulerConfig,
    driver: Driver,

    queue: Mutex<VecDeque<RunEntry>>,

    /// Spawned workers; `None` before `start` and after `stop`
    workers: Mutex<Option<WorkerPool>>,
    thread_ids: RwLock<Vec<i32>>,

    /// Threads currently running a task
    active: AtomicUsize,
    /// Threads currently in their idle fiber
    idle: AtomicUsize,

    started: AtomicBool,
    stopping: AtomicBool,
    auto_stop: AtomicBool,

    /// Loop fiber of a participating caller thread
    root_fiber: Option<Arc<Fiber>>,
    root_thread: Option<i32>,
    /// Hook flag of the caller thread before its loop enabled hooking
    caller_hook: bool,

    me: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a cooperative scheduler
    ///
    /// Worker threads are spawned by [`start`](Self::start). With
    /// `use_caller`, the calling thread is bound to the scheduler at once.
    pub fn new(config: SchedulerConfig) -> SchedResult<Arc<Scheduler>> {
        Self::with_driver(config, Driver::Cooperative(new_parking()))
    }

    pub(crate) fn with_driver(config: SchedulerConfig, driver: Driver) -> SchedResult<Arc<Scheduler>> {
        config.validate()?;
        if config.use_caller {
            kassert!(
                tls::scheduler().is_none(),
                "thread already belongs to a scheduler, cannot create '{}' with use_caller",
                config.name
            );
            // The caller's own context must exist before the root fiber
            // switches away from it.
            Fiber::current();
        }

        let root_thread = config.use_caller.then(tls::thread_id);
        let caller_hook = tls::is_hook_enable();
        let sched = Arc::new_cyclic(|me: &Weak<Scheduler>| {
            let root_fiber = config.use_caller.then(|| {
                let weak = me.clone();
                Fiber::new_root(Box::new(move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                }))
            });
            Scheduler {
                name: config.name.clone(),
                config,
                driver,
                queue: Mutex::new(VecDeque::new()),
                workers: Mutex::new(None),
                thread_ids: RwLock::new(root_thread.into_iter().collect()),
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                auto_stop: AtomicBool::new(false),
                root_fiber,
                root_thread,
                caller_hook,
                me: me.clone(),
            }
        });

        if let Some(root) = &sched.root_fiber {
            tls::set_scheduler(Some(Arc::downgrade(&sched)));
            tls::set_sched_fiber(Arc::as_ptr(root));
        }
        kdebug!("scheduler '{}' created ({} threads, use_caller={})",
            sched.name, sched.config.threads, sched.config.use_caller);
        Ok(sched)
    }

    /// The scheduler bound to the calling thread
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::scheduler()
    }

    fn is_current(&self) -> bool {
        tls::scheduler().is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s), self))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Kernel thread ids of every thread running this scheduler's loop
    pub fn thread_ids(&self) -> Vec<i32> {
        self.thread_ids.read().map(|ids| ids.clone()).unwrap_or_default()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::Acquire) > 0
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    // ── queue ──

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<RunEntry>> {
        // Tasks run outside the lock, so a poisoned queue still holds valid entries
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push<I>(&self, entries: I)
    where
        I: IntoIterator<Item = RunEntry>,
    {
        let need_tickle = {
            let mut queue = self.lock_queue();
            let was_empty = queue.is_empty();
            queue.extend(entries);
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue a closure to run on some worker
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::callback(f), None);
    }

    /// Queue a closure to run on the thread with kernel id `thread`
    pub fn schedule_on<F>(&self, f: F, thread: i32)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::callback(f), Some(thread));
    }

    /// Queue a fiber to be resumed
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::Fiber(fiber), None);
    }

    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, thread: i32) {
        self.schedule_task(Task::Fiber(fiber), Some(thread));
    }

    pub fn schedule_task(&self, task: Task, thread: Option<i32>) {
        self.push(std::iter::once(RunEntry { task, thread }));
    }

    /// Queue several tasks with at most one wake-up
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.push(tasks.into_iter().map(|task| RunEntry { task, thread: None }));
    }

    /// Take the first entry runnable on thread `tid`
    ///
    /// The returned flag asks the caller to wake another worker: entries
    /// were skipped or remain queued.
    fn take_next(&self, tid: i32) -> (Option<Task>, bool) {
        let mut queue = self.lock_queue();
        let mut tickle_me = false;
        let mut found = None;

        for (i, entry) in queue.iter().enumerate() {
            if entry.thread.is_some_and(|t| t != tid) {
                tickle_me = true;
                continue;
            }
            if let Task::Fiber(fiber) = &entry.task {
                // Still switching out on another thread
                if fiber.state() == FiberState::Exec {
                    tickle_me = true;
                    continue;
                }
            }
            found = Some(i);
            break;
        }

        let task = found.and_then(|i| queue.remove(i)).map(|entry| entry.task);
        if task.is_some() {
            self.active.fetch_add(1, Ordering::AcqRel);
            tickle_me |= !queue.is_empty();
        }
        (task, tickle_me)
    }

    // ── lifecycle ──

    /// Spawn the worker threads
    pub fn start(&self) -> SchedResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SchedError::AlreadyInitialized);
        }
        if self.stopping.load(Ordering::Acquire) {
            return Err(SchedError::InvalidState);
        }
        let Some(me) = self.me.upgrade() else {
            return Err(SchedError::InvalidState);
        };

        let count = self.config.spawned_threads();
        let pool = WorkerPool::start(count, &self.name, move |_| me.run())?;
        if let Ok(mut ids) = self.thread_ids.write() {
            ids.extend_from_slice(pool.thread_ids());
        }
        *self.workers.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        kinfo!("scheduler '{}' started with {} workers", self.name, count);
        Ok(())
    }

    /// Finish all queued work, then shut the workers down
    ///
    /// Blocks until every worker has exited. On a `use_caller` scheduler
    /// this must be called from the creating thread, whose root fiber
    /// runs the loop until it drains.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::Release);

        if let Some(root) = &self.root_fiber {
            if self.config.spawned_threads() == 0
                && matches!(root.state(), FiberState::Term | FiberState::Init)
            {
                self.stopping.store(true, Ordering::Release);
                if self.stopping() {
                    kinfo!("scheduler '{}' stopped", self.name);
                    self.release_caller();
                    return;
                }
            }
        }

        match self.root_thread {
            Some(root) => kassert!(
                tls::thread_id() == root,
                "scheduler '{}' must be stopped from the thread that created it",
                self.name
            ),
            None => kassert!(
                !self.is_current(),
                "scheduler '{}' cannot be stopped from one of its own workers",
                self.name
            ),
        }

        self.stopping.store(true, Ordering::Release);
        self.tickle_all();

        if let Some(root) = &self.root_fiber {
            if !root.state().is_terminal() && !self.stopping() {
                root.call();
            }
        }

        let pool = self.workers.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            if let Err(e) = pool.join() {
                kwarn!("scheduler '{}': {}", self.name, e);
            }
        }
        self.release_caller();
        kinfo!("scheduler '{}' stopped", self.name);
    }

    /// Unbind a participating caller thread once its loop is done
    fn release_caller(&self) {
        let Some(root) = &self.root_fiber else {
            return;
        };
        if self.root_thread == Some(tls::thread_id()) && std::ptr::eq(tls::sched_fiber(), Arc::as_ptr(root)) {
            tls::set_sched_fiber(std::ptr::null());
            tls::set_scheduler(None);
            tls::set_hook_enable(self.caller_hook);
        }
    }

    /// True once the scheduler may exit: stop requested and nothing left to run
    pub fn stopping(&self) -> bool {
        let base = self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.lock_queue().is_empty()
            && self.active.load(Ordering::Acquire) == 0;
        match &self.driver {
            Driver::Cooperative(_) => base,
            Driver::Reactor(reactor) => base && reactor.is_quiescent(),
        }
    }

    /// Wake one idle worker
    pub(crate) fn tickle(&self) {
        match &self.driver {
            Driver::Cooperative(parking) => parking.wake_one(),
            Driver::Reactor(reactor) => reactor.tickle(),
        }
    }

    fn tickle_all(&self) {
        match &self.driver {
            Driver::Cooperative(parking) => parking.wake_all(),
            Driver::Reactor(reactor) => {
                for _ in 0..self.config.threads {
                    reactor.tickle();
                }
            }
        }
    }

    // ── worker loop ──

    fn run(self: &Arc<Self>) {
        let tid = tls::thread_id();
        kdebug!("scheduler '{}' loop on thread {}", self.name, tid);
        tls::set_scheduler(Some(Arc::downgrade(self)));
        if matches!(self.driver, Driver::Reactor(_)) {
            tls::set_hook_enable(tls::hook_default());
        }

        let idle_fiber = {
            let me = Arc::clone(self);
            Fiber::new(move || me.idle(), 0)
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let (task, tickle_me) = self.take_next(tid);
            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task::Fiber(fiber)) => {
                    if fiber.state().is_terminal() {
                        kwarn!("dropping finished fiber {} found in run queue", fiber.id());
                    } else {
                        fiber.swap_in();
                        if fiber.state() == FiberState::Ready {
                            self.schedule_fiber(fiber);
                        }
                    }
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
                Some(Task::Callback(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_boxed(cb);
                            fiber
                        }
                        None => Fiber::from_boxed(cb),
                    };
                    fiber.swap_in();
                    match fiber.state() {
                        FiberState::Ready => self.schedule_fiber(fiber),
                        FiberState::Term | FiberState::Except => cb_fiber = Some(fiber),
                        // Parked: whoever holds it will re-schedule it
                        _ => {}
                    }
                    // Only after a yielded fiber is queued again
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        kdebug!("scheduler '{}' idle fiber finished", self.name);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.swap_in();
                    self.idle.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        if self.root_thread != Some(tid) {
            tls::set_scheduler(None);
        }
    }

    fn idle(&self) {
        match &self.driver {
            Driver::Cooperative(parking) => loop {
                if self.stopping() {
                    break;
                }
                parking.park(Some(self.config.park_timeout));
                Fiber::yield_to_hold();
            },
            Driver::Reactor(reactor) => reactor.idle(self),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.stopping.load(Ordering::Acquire) && self.started.load(Ordering::Acquire) {
            kwarn!("scheduler '{}' dropped without stop()", self.name);
        }
        self.release_caller();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.config.threads)
            .field("use_caller", &self.config.use_caller)
            .field("active", &self.active_count())
            .finish()
    }
}
