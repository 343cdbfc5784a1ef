//! # Blocking-style syscall wrappers for fibers
//!
//! Each function has the signature and contract of its libc namesake
//! (`-1` plus `errno` on failure). Called from a fiber on a thread whose
//! hook flag is on, a call that would block suspends the fiber instead:
//!
//! ```text
//!   real call ──EAGAIN──► arm fd in IoManager ──► yield_to_hold
//!       ▲                 (+ timer if SO_*TIMEO)        │
//!       └──────────── retry ◄── readiness / timeout ◄───┘
//! ```
//!
//! Anywhere else (plain threads, hook flag off, descriptors that are not
//! sockets, sockets the user put in non-blocking mode) they forward to libc
//! unchanged.
//!
//! ```ignore
//! // Inside a fiber: looks blocking, the worker thread keeps running others
//! let n = unsafe { syscall::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
//! syscall::usleep(10_000);
//! ```

use crate::fd::FdManager;
use fiberio_core::{kdebug, kerror, CancelToken, SchedError};
use fiberio_runtime::config;
use fiberio_runtime::{Event, Fiber, IoManager};
use libc::{c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec};
use nix::errno::Errno;
use std::os::fd::RawFd;
use std::sync::Arc;

pub use fiberio_runtime::tls::{hook_default, is_hook_enable, set_hook_default, set_hook_enable};

#[inline]
fn errno() -> c_int {
    Errno::last() as c_int
}

#[inline]
fn set_errno(err: c_int) {
    Errno::set_raw(err);
}

/// The manager to suspend on, if the caller may be suspended
fn hook_target() -> Option<IoManager> {
    if is_hook_enable() && fiberio_runtime::tls::in_fiber() {
        IoManager::current()
    } else {
        None
    }
}

/// Suspend the calling fiber until `event` fires on `fd` or `timeout_ms` elapses
///
/// Returns the errno to report: `ETIMEDOUT` on timeout, or the error of a
/// failed registration.
pub fn wait_ready(iom: &IoManager, fd: RawFd, event: Event, timeout_ms: Option<u64>) -> Result<(), c_int> {
    if let Err(e) = iom.add_event(fd, event, None) {
        kerror!("fd {}: cannot wait for {:?}: {}", fd, event, e);
        return Err(match e {
            SchedError::Os(err) => err,
            _ => libc::EINVAL,
        });
    }

    // Armed before the timer exists: an early expiry always finds the
    // event and cancels it. The woken fiber is only resumed once parked.
    let token = CancelToken::new();
    let timer = timeout_ms.map(|ms| {
        let weak_token = token.downgrade();
        let reactor = Arc::downgrade(iom.reactor());
        iom.add_condition_timer(
            ms,
            move || {
                let (Some(token), Some(reactor)) = (weak_token.upgrade(), reactor.upgrade()) else {
                    return;
                };
                reactor.cancel_event_with(fd, event, || {
                    token.cancel(libc::ETIMEDOUT);
                });
            },
            token.guard(),
            false,
        )
    });

    #[cfg(test)]
    tests::delay_before_park();
    Fiber::yield_to_hold();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    match token.reason() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run `op`, suspending the fiber on `EAGAIN` until `fd` is ready for `event`
///
/// `timeout_kind` selects the recorded `SO_RCVTIMEO`/`SO_SNDTIMEO`.
fn do_io<F>(fd: RawFd, name: &str, event: Event, timeout_kind: c_int, mut op: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    let Some(iom) = hook_target() else {
        return op();
    };
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return op();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op();
    }

    let timeout = ctx.timeout(timeout_kind);
    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        if let Err(err) = wait_ready(&iom, fd, event, timeout) {
            kdebug!("{}(fd={}) gave up: errno {}", name, fd, err);
            set_errno(err);
            return -1;
        }
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
    }
}

// ── sleep ──

/// Park the calling fiber on a timer of `iom` for `ms` milliseconds
pub fn park_for(iom: &IoManager, ms: u64) {
    let fiber = Fiber::current();
    let sched = Arc::downgrade(iom.scheduler());
    iom.add_timer(
        ms,
        move || {
            if let Some(sched) = sched.upgrade() {
                sched.schedule_fiber(Arc::clone(&fiber));
            }
        },
        false,
    );
    Fiber::yield_to_hold();
}

pub fn sleep(seconds: c_uint) -> c_uint {
    match hook_target() {
        Some(iom) => {
            park_for(&iom, seconds as u64 * 1000);
            0
        }
        None => unsafe { libc::sleep(seconds) },
    }
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    match hook_target() {
        Some(iom) => {
            park_for(&iom, usec as u64 / 1000);
            0
        }
        None => unsafe { libc::usleep(usec) },
    }
}

/// # Safety
///
/// Same contract as `nanosleep(2)`.
pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    let Some(iom) = hook_target() else {
        return libc::nanosleep(req, rem);
    };
    if req.is_null() {
        set_errno(libc::EFAULT);
        return -1;
    }
    let req = &*req;
    if req.tv_sec < 0 || !(0..1_000_000_000).contains(&req.tv_nsec) {
        set_errno(libc::EINVAL);
        return -1;
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    park_for(&iom, ms);
    0
}

// ── sockets ──

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 || !is_hook_enable() {
        return fd;
    }
    if let Some(ctx) = FdManager::global().get(fd, true) {
        if ty & libc::SOCK_NONBLOCK != 0 {
            ctx.set_user_nonblock(true);
        }
    }
    fd
}

/// `connect(2)` that waits at most `timeout_ms` for the handshake
///
/// # Safety
///
/// `addr` must point to `len` readable bytes.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
    timeout_ms: Option<u64>,
) -> c_int {
    if !is_hook_enable() {
        return libc::connect(fd, addr, len);
    }
    let ctx = match FdManager::global().get(fd, false) {
        Some(ctx) if !ctx.is_closed() => ctx,
        _ => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, len);
    }
    let Some(iom) = hook_target() else {
        return libc::connect(fd, addr, len);
    };

    let n = libc::connect(fd, addr, len);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    if let Err(err) = wait_ready(&iom, fd, Event::Write, timeout_ms) {
        set_errno(err);
        return -1;
    }
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }

    let mut error: c_int = 0;
    let mut error_len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut error_len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// `connect(2)` bounded by the `tcp.connect.timeout` config var
///
/// # Safety
///
/// `addr` must point to `len` readable bytes.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, len, Some(config::tcp_connect_timeout().get()))
}

/// # Safety
///
/// Same contract as `accept(2)`.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    let n = do_io(fd, "accept", Event::Read, libc::SO_RCVTIMEO, || {
        libc::accept(fd, addr, len) as ssize_t
    }) as c_int;
    if n >= 0 {
        FdManager::global().get(n, true);
    }
    n
}

// ── read family ──

/// # Safety
///
/// Same contract as `read(2)`.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, libc::SO_RCVTIMEO, || libc::read(fd, buf, count))
}

/// # Safety
///
/// Same contract as `readv(2)`.
pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, libc::SO_RCVTIMEO, || libc::readv(fd, iov, iovcnt))
}

/// # Safety
///
/// Same contract as `recv(2)`.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::Read, libc::SO_RCVTIMEO, || libc::recv(fd, buf, len, flags))
}

/// # Safety
///
/// Same contract as `recvfrom(2)`.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::Read, libc::SO_RCVTIMEO, || {
        libc::recvfrom(fd, buf, len, flags, addr, addrlen)
    })
}

/// # Safety
///
/// Same contract as `recvmsg(2)`.
pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::Read, libc::SO_RCVTIMEO, || libc::recvmsg(fd, msg, flags))
}

// ── write family ──

/// # Safety
///
/// Same contract as `write(2)`.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, libc::SO_SNDTIMEO, || libc::write(fd, buf, count))
}

/// # Safety
///
/// Same contract as `writev(2)`.
pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, libc::SO_SNDTIMEO, || libc::writev(fd, iov, iovcnt))
}

/// # Safety
///
/// Same contract as `send(2)`.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::Write, libc::SO_SNDTIMEO, || libc::send(fd, buf, len, flags))
}

/// # Safety
///
/// Same contract as `sendto(2)`.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::Write, libc::SO_SNDTIMEO, || {
        libc::sendto(fd, buf, len, flags, addr, addrlen)
    })
}

/// # Safety
///
/// Same contract as `sendmsg(2)`.
pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::Write, libc::SO_SNDTIMEO, || libc::sendmsg(fd, msg, flags))
}

// ── descriptor control ──

/// Close `fd`, first waking every fiber waiting on it
///
/// The woken waiters fail with `EBADF`. The descriptor's context is
/// dropped even with the hook flag off, so a reused number starts fresh.
pub fn close(fd: c_int) -> c_int {
    if let Some(ctx) = FdManager::global().get(fd, false) {
        ctx.mark_closed();
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdManager::global().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl(2)` for commands taking an integer argument
///
/// `F_SETFL`/`F_GETFL` on sockets read and write the user's view of
/// `O_NONBLOCK`; the descriptor itself stays non-blocking.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    let ctx = FdManager::global()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_socket());

    match (cmd, ctx) {
        (libc::F_SETFL, Some(ctx)) => {
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let arg = if ctx.sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        (libc::F_GETFL, Some(ctx)) => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 {
                flags
            } else if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        (libc::F_GETFL, None) => unsafe { libc::fcntl(fd, cmd) },
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl(2)`; `FIONBIO` records the user's non-blocking choice
///
/// # Safety
///
/// `arg` must be valid for `request`.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = FdManager::global().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request as _, arg)
}

/// # Safety
///
/// Same contract as `getsockopt(2)`.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    libc::getsockopt(fd, level, name, value, len)
}

/// `setsockopt(2)`; receive/send timeouts are also recorded for the hooks
///
/// A zero timeval means no timeout.
///
/// # Safety
///
/// `value` must point to `len` readable bytes.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    if is_hook_enable()
        && level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && !value.is_null()
        && len as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            let tv = &*(value as *const libc::timeval);
            let ms = tv.tv_sec.max(0) as u64 * 1000 + tv.tv_usec.max(0) as u64 / 1000;
            ctx.set_timeout(name, (ms > 0).then_some(ms));
        }
    }
    libc::setsockopt(fd, level, name, value, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiberio_runtime::SchedulerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::cell::Cell;
    use std::time::{Duration, Instant};

    thread_local! {
        /// Stall between arming a wait and parking, once
        static PARK_DELAY_MS: Cell<u64> = const { Cell::new(0) };
    }

    pub(super) fn delay_before_park() {
        let ms = PARK_DELAY_MS.with(|c| c.replace(0));
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    fn iomanager(name: &str, threads: usize) -> IoManager {
        IoManager::new(SchedulerConfig::new().name(name).threads(threads)).unwrap()
    }

    /// Socket pair registered with the hook layer (blocking for the user)
    fn hooked_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr()) },
            0
        );
        FdManager::global().get(fds[0], true);
        FdManager::global().get(fds[1], true);
        (fds[0], fds[1])
    }

    fn release(fd: RawFd) {
        FdManager::global().del(fd);
        unsafe { libc::close(fd) };
    }

    fn set_recv_timeout(fd: RawFd, ms: i64) {
        let tv = libc::timeval {
            tv_sec: ms / 1000,
            tv_usec: (ms % 1000) * 1000,
        };
        let rc = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(rc, 0);
    }

    #[test]
    fn test_read_times_out() {
        let iom = iomanager("hook-timeout", 1);
        let (a, b) = hooked_pair();
        let (tx, rx) = mpsc::channel();

        iom.schedule(move || {
            set_recv_timeout(a, 50);
            let start = Instant::now();
            let mut buf = [0u8; 16];
            let n = unsafe { read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            let err = errno();
            let elapsed = start.elapsed();
            // The write direction is still usable
            let w = unsafe { write(a, b"x".as_ptr() as *const c_void, 1) };
            let _ = tx.send((n, err, elapsed, w));
        });

        let (n, err, elapsed, w) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, -1);
        assert_eq!(err, libc::ETIMEDOUT);
        assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(1), "{:?}", elapsed);
        assert_eq!(w, 1);

        iom.stop();
        assert_eq!(iom.pending_events(), 0);
        release(a);
        release(b);
    }

    #[test]
    fn test_timeout_expiring_before_park() {
        let iom = iomanager("hook-early", 2);
        let (a, b) = hooked_pair();
        let (tx, rx) = mpsc::channel();

        iom.schedule(move || {
            set_recv_timeout(a, 1);
            // The timer expires on the other worker while this fiber still runs
            PARK_DELAY_MS.with(|c| c.set(30));
            let mut buf = [0u8; 16];
            let n = unsafe { read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            let _ = tx.send((n, errno()));
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), (-1, libc::ETIMEDOUT));
        iom.stop();
        assert_eq!(iom.pending_events(), 0);
        release(a);
        release(b);
    }

    #[test]
    fn test_read_completes_before_timeout() {
        let iom = iomanager("hook-ready", 2);
        let (a, b) = hooked_pair();
        let (tx, rx) = mpsc::channel();

        iom.schedule(move || {
            set_recv_timeout(a, 2000);
            let mut buf = [0u8; 16];
            let n = unsafe { read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            let _ = tx.send((n, buf[0]));
        });
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(unsafe { libc::write(b, b"z".as_ptr() as *const c_void, 1) }, 1);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (1, b'z'));
        // The timeout timer was cancelled, so stop does not wait for it
        let start = Instant::now();
        iom.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        release(a);
        release(b);
    }

    #[test]
    fn test_close_wakes_reader_with_ebadf() {
        let iom = iomanager("hook-close", 1);
        let (a, b) = hooked_pair();
        let (tx, rx) = mpsc::channel();

        iom.schedule(move || {
            let mut buf = [0u8; 16];
            let n = unsafe { read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            let _ = tx.send((n, errno()));
        });
        iom.schedule(move || {
            usleep(30_000);
            assert_eq!(close(a), 0);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (-1, libc::EBADF));
        iom.stop();
        release(b);
    }

    #[test]
    fn test_sleeps_overlap_on_one_thread() {
        let iom = iomanager("hook-sleep", 1);
        let done = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        for _ in 0..10 {
            let d = Arc::clone(&done);
            iom.schedule(move || {
                assert_eq!(usleep(100_000), 0);
                d.fetch_add(1, Ordering::SeqCst);
            });
        }
        iom.stop();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(start.elapsed() < Duration::from_millis(600), "{:?}", start.elapsed());
    }

    #[test]
    fn test_nanosleep_and_sleep_outside_fiber() {
        let req = libc::timespec { tv_sec: 0, tv_nsec: 5_000_000 };
        let start = Instant::now();
        assert_eq!(unsafe { nanosleep(&req, std::ptr::null_mut()) }, 0);
        assert!(start.elapsed() >= Duration::from_millis(4));
        assert_eq!(sleep(0), 0);
    }

    #[test]
    fn test_user_nonblock_passes_eagain_through() {
        let iom = iomanager("hook-nonblock", 1);
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            let blocking_view = fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK == 0;
            let os_nonblock = unsafe { libc::fcntl(fd, libc::F_GETFL) } & libc::O_NONBLOCK != 0;

            let flags = fcntl(fd, libc::F_GETFL, 0);
            fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            let user_view = fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0;
            let ctx_flag = FdManager::global().get(fd, false).map(|c| c.user_nonblock());
            close(fd);
            let _ = tx.send((blocking_view, os_nonblock, user_view, ctx_flag));
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (true, true, true, Some(true))
        );
        iom.stop();
    }

    #[test]
    fn test_hook_disabled_passes_through() {
        let iom = iomanager("hook-off", 1);
        let (a, b) = hooked_pair();
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            set_hook_enable(false);
            let mut buf = [0u8; 4];
            let n = unsafe { read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            let err = errno();
            set_hook_enable(true);
            let _ = tx.send((n, err));
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (-1, libc::EAGAIN));
        iom.stop();
        release(a);
        release(b);
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let iom = iomanager("hook-refused", 1);
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = port.to_be();
            addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
            let rc = unsafe {
                connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            };
            let err = errno();
            close(fd);
            let _ = tx.send((rc, err));
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (-1, libc::ECONNREFUSED));
        iom.stop();
    }
}
