//! Per-descriptor state consulted by the hook layer
//!
//! An [`FdCtx`] records what the hooks need to know about a descriptor:
//! whether it is a socket, whether the runtime or the user asked for
//! non-blocking mode, whether it was closed, and the per-direction
//! timeouts set with `SO_RCVTIMEO`/`SO_SNDTIMEO`.
//!
//! Sockets are switched to `O_NONBLOCK` at the OS level when their context
//! is created. The user keeps seeing blocking semantics unless they ask for
//! non-blocking mode themselves.

use fiberio_core::kdebug;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

const NO_TIMEOUT: u64 = u64::MAX;

/// Initial size of the descriptor table
const INITIAL_SLOTS: usize = 64;

/// Hook-layer view of one descriptor
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    /// Probe `fd` and, for sockets, force `O_NONBLOCK`
    fn new(fd: RawFd) -> FdCtx {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_init = unsafe { libc::fstat(fd, &mut st) } == 0;
        let is_socket = is_init && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags >= 0 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                sys_nonblock = true;
            }
        }
        kdebug!("fd {} ctx: init={} socket={}", fd, is_init, is_socket);

        FdCtx {
            fd,
            is_init,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The `fstat` check succeeded
    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// `O_NONBLOCK` was set by the runtime
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// The user asked for non-blocking mode
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, yes: bool) {
        self.user_nonblock.store(yes, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn slot(&self, kind: libc::c_int) -> &AtomicU64 {
        if kind == libc::SO_RCVTIMEO {
            &self.recv_timeout
        } else {
            &self.send_timeout
        }
    }

    /// Timeout in ms for `kind` (`SO_RCVTIMEO` or `SO_SNDTIMEO`)
    pub fn timeout(&self, kind: libc::c_int) -> Option<u64> {
        match self.slot(kind).load(Ordering::Acquire) {
            NO_TIMEOUT => None,
            ms => Some(ms),
        }
    }

    pub fn set_timeout(&self, kind: libc::c_int, ms: Option<u64>) {
        self.slot(kind).store(ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
    }
}

/// Process-wide table of [`FdCtx`] indexed by descriptor
pub struct FdManager {
    ctxs: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> Self {
        Self {
            ctxs: RwLock::new(vec![None; INITIAL_SLOTS]),
        }
    }

    pub fn global() -> &'static FdManager {
        static MANAGER: OnceLock<FdManager> = OnceLock::new();
        MANAGER.get_or_init(FdManager::new)
    }

    /// Context of `fd`, created on first use if `auto_create`
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let ctxs = self.ctxs.read().unwrap_or_else(|e| e.into_inner());
            match ctxs.get(idx) {
                Some(Some(ctx)) => return Some(Arc::clone(ctx)),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut ctxs = self.ctxs.write().unwrap_or_else(|e| e.into_inner());
        if idx >= ctxs.len() {
            let want = (idx + 1).max(idx * 3 / 2);
            ctxs.resize(want, None);
        }
        let ctx = ctxs[idx].get_or_insert_with(|| Arc::new(FdCtx::new(fd)));
        Some(Arc::clone(ctx))
    }

    /// Forget `fd`; holders of its context keep their `Arc`
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut ctxs = self.ctxs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = ctxs.get_mut(fd as usize) {
            *slot = None;
        }
    }
}
