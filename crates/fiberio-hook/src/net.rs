//! # TCP on fibers
//!
//! `FiberListener` and `FiberStream` wrap socket descriptors with the hooked
//! calls from [`crate::syscall`], so code running in a fiber reads like
//! ordinary blocking networking:
//!
//! ```ignore
//! let listener = FiberListener::bind("127.0.0.1:8080".parse()?)?;
//! loop {
//!     let stream = listener.accept()?;
//!     iom.schedule(move || {
//!         let mut buf = [0u8; 4096];
//!         while let Ok(n @ 1..) = stream.read(&mut buf) {
//!             let _ = stream.write_fix_size(&buf[..n]);
//!         }
//!     });
//! }
//! ```
//!
//! [`TcpServer`] packages that loop: accept fibers on one IoManager, client
//! handlers on another.
//!
//! Sockets created here are registered with the [`FdManager`] and are
//! therefore non-blocking at the OS level. Use them from fibers.

use crate::fd::FdManager;
use crate::stream::{SocketStream, Stream};
use crate::syscall;
use fiberio_core::{kdebug, kerror, kinfo};
use fiberio_runtime::{config, IoManager};
use libc::{c_int, c_void, sockaddr, sockaddr_storage, socklen_t};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LISTEN_BACKLOG: c_int = 4096;

// ── socket addresses ──

fn to_sockaddr(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut sockaddr_storage as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut sockaddr_storage as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn from_sockaddr(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const sockaddr_storage as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const sockaddr_storage as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {}", family),
        )),
    }
}

fn query_addr(fd: RawFd, peer: bool) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<sockaddr_storage>() as socklen_t;
    let ptr = &mut storage as *mut sockaddr_storage as *mut sockaddr;
    let rc = unsafe {
        if peer {
            libc::getpeername(fd, ptr, &mut len)
        } else {
            libc::getsockname(fd, ptr, &mut len)
        }
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&storage)
}

fn set_int_opt(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let rc = unsafe {
        syscall::setsockopt(
            fd,
            level,
            name,
            &value as *const c_int as *const c_void,
            std::mem::size_of::<c_int>() as socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_timeout_opt(fd: RawFd, name: c_int, timeout: Option<Duration>) -> io::Result<()> {
    let tv = match timeout {
        Some(d) => libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        },
        None => libc::timeval { tv_sec: 0, tv_usec: 0 },
    };
    let rc = unsafe {
        syscall::setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            &tv as *const libc::timeval as *const c_void,
            std::mem::size_of::<libc::timeval>() as socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    // Record it for fibers even when the caller's hook flag is off
    if let Some(ctx) = FdManager::global().get(fd, false) {
        ctx.set_timeout(name, timeout.map(|d| d.as_millis() as u64).filter(|&ms| ms > 0));
    }
    Ok(())
}

/// Create a hooked TCP socket for `addr`'s family
fn tcp_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = syscall::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if FdManager::global().get(fd, true).is_none() {
        syscall::close(fd);
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    Ok(fd)
}

// ── listener ──

/// A bound, listening TCP socket
pub struct FiberListener {
    fd: RawFd,
    closed: AtomicBool,
}

impl FiberListener {
    /// Bind to `addr` and start listening
    pub fn bind(addr: SocketAddr) -> io::Result<FiberListener> {
        let fd = tcp_socket(&addr)?;
        let listener = FiberListener {
            fd,
            closed: AtomicBool::new(false),
        };

        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        let (storage, len) = to_sockaddr(&addr);
        if unsafe { libc::bind(fd, &storage as *const sockaddr_storage as *const sockaddr, len) } == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(fd, LISTEN_BACKLOG) } == -1 {
            return Err(io::Error::last_os_error());
        }
        kdebug!("listening on {} (fd {})", addr, fd);
        Ok(listener)
    }

    /// Wait for a connection
    ///
    /// In a fiber this suspends the fiber, not the thread.
    pub fn accept(&self) -> io::Result<FiberStream> {
        let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<sockaddr_storage>() as socklen_t;
        let fd = unsafe {
            syscall::accept(
                self.fd,
                &mut storage as *mut sockaddr_storage as *mut sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        let stream = FiberStream::from_fd(fd);
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
        Ok(stream)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        query_addr(self.fd, false)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Close the socket; a fiber blocked in `accept` fails with `EBADF`
    ///
    /// Waking that fiber requires calling this on a thread of the IoManager
    /// it waits on.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            syscall::close(self.fd);
        }
    }
}

impl Drop for FiberListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FiberListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberListener").field("fd", &self.fd).finish()
    }
}

// ── stream ──

/// A connected TCP socket
#[derive(Debug)]
pub struct FiberStream {
    inner: SocketStream,
}

impl FiberStream {
    fn from_fd(fd: RawFd) -> FiberStream {
        FiberStream {
            inner: SocketStream::new(fd),
        }
    }

    /// Connect to `addr`, waiting at most `timeout`
    ///
    /// Without a timeout the `tcp.connect.timeout` config var applies.
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<FiberStream> {
        let fd = tcp_socket(&addr)?;
        let stream = FiberStream::from_fd(fd);
        let timeout_ms = timeout
            .map(|d| d.as_millis() as u64)
            .unwrap_or_else(|| config::tcp_connect_timeout().get());

        let (storage, len) = to_sockaddr(&addr);
        let rc = unsafe {
            syscall::connect_with_timeout(
                fd,
                &storage as *const sockaddr_storage as *const sockaddr,
                len,
                Some(timeout_ms),
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
        Ok(stream)
    }

    /// Bound blocking reads; `None` waits forever
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_timeout_opt(self.fd(), libc::SO_RCVTIMEO, timeout)
    }

    /// Bound blocking writes; `None` waits forever
    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_timeout_opt(self.fd(), libc::SO_SNDTIMEO, timeout)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        query_addr(self.fd(), true)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        query_addr(self.fd(), false)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.fd()
    }
}

impl Stream for FiberStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl io::Read for FiberStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl io::Write for FiberStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── server ──

/// Serves one accepted connection
pub trait ClientHandler: Send + Sync + 'static {
    fn handle_client(&self, stream: FiberStream);
}

impl<F> ClientHandler for F
where
    F: Fn(FiberStream) + Send + Sync + 'static,
{
    fn handle_client(&self, stream: FiberStream) {
        self(stream)
    }
}

/// TCP server: accept fibers on `accept_worker`, handlers on `worker`
pub struct TcpServer {
    worker: IoManager,
    accept_worker: IoManager,
    handler: Arc<dyn ClientHandler>,
    listeners: Mutex<Vec<Arc<FiberListener>>>,
    running: AtomicBool,
    /// Receive timeout applied to accepted sockets (ms, 0 = none)
    read_timeout: AtomicU64,
}

impl TcpServer {
    pub fn new<H>(worker: IoManager, accept_worker: IoManager, handler: H) -> Arc<TcpServer>
    where
        H: ClientHandler,
    {
        Arc::new(TcpServer {
            worker,
            accept_worker,
            handler: Arc::new(handler),
            listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            read_timeout: AtomicU64::new(config::tcp_server_read_timeout().get()),
        })
    }

    /// Listen on `addr`; returns the bound address
    pub fn bind(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = FiberListener::bind(addr)?;
        let local = listener.local_addr()?;
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
        kinfo!("tcp server bound {}", local);
        Ok(local)
    }

    /// Listen on every address; on failure the addresses that could not be bound
    pub fn bind_all(&self, addrs: &[SocketAddr]) -> Result<Vec<SocketAddr>, Vec<SocketAddr>> {
        let mut bound = Vec::with_capacity(addrs.len());
        let mut failed = Vec::new();
        for &addr in addrs {
            match FiberListener::bind(addr) {
                Ok(listener) => bound.push(listener),
                Err(e) => {
                    kerror!("tcp server bind {} failed: {}", addr, e);
                    failed.push(addr);
                }
            }
        }
        if !failed.is_empty() {
            return Err(failed);
        }

        let mut locals = Vec::with_capacity(bound.len());
        for listener in &bound {
            locals.push(listener.local_addr().map_err(|_| addrs.to_vec())?);
        }
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.extend(bound.into_iter().map(Arc::new));
        Ok(locals)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(0, |d| d.as_millis() as u64);
        self.read_timeout.store(ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start one accept fiber per listener; false if already running
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            let server = Arc::clone(self);
            self.accept_worker.schedule(move || server.accept_loop(&listener));
        }
        true
    }

    /// Close every listener, ending the accept fibers
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        self.accept_worker.schedule(move || {
            for listener in &listeners {
                listener.close();
            }
        });
    }

    fn accept_loop(self: Arc<Self>, listener: &FiberListener) {
        while self.is_running() {
            match listener.accept() {
                Ok(client) => {
                    if let Err(e) = client.set_recv_timeout(self.read_timeout()) {
                        kerror!("fd {}: cannot set read timeout: {}", client.fd(), e);
                    }
                    let server = Arc::clone(&self);
                    self.worker.schedule(move || server.handler.handle_client(client));
                }
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => break,
                Err(e) => {
                    kerror!("accept on fd {} failed: {}", listener.fd(), e);
                }
            }
        }
        kdebug!("accept loop on fd {} done", listener.fd());
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("running", &self.is_running())
            .field("read_timeout", &self.read_timeout())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiberio_runtime::SchedulerConfig;
    use std::io::{Read, Write};
    use std::sync::mpsc;

    fn iomanager(name: &str, threads: usize) -> IoManager {
        IoManager::new(SchedulerConfig::new().name(name).threads(threads)).unwrap()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_sockaddr_conversion() {
        for addr in ["10.1.2.3:8080", "[::1]:443"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let (storage, _) = to_sockaddr(&addr);
            assert_eq!(from_sockaddr(&storage).unwrap(), addr);
        }
    }

    #[test]
    fn test_fiber_echo_roundtrip() {
        let iom = iomanager("net-echo", 2);
        let listener = Arc::new(FiberListener::bind(loopback()).unwrap());
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();

        let l = Arc::clone(&listener);
        iom.schedule(move || {
            let stream = l.accept().unwrap();
            let mut buf = [0u8; 5];
            let n = stream.read_fix_size(&mut buf).unwrap();
            stream.write_fix_size(&buf[..n]).unwrap();
        });
        iom.schedule(move || {
            let stream = FiberStream::connect(addr, Some(Duration::from_secs(2))).unwrap();
            assert_eq!(stream.peer_addr().unwrap(), addr);
            stream.write_fix_size(b"hello").unwrap();
            let mut buf = [0u8; 5];
            stream.read_fix_size(&mut buf).unwrap();
            let _ = tx.send(buf);
        });

        assert_eq!(&rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"hello");
        iom.stop();
    }

    #[test]
    fn test_server_echo_and_stop() {
        let worker = iomanager("srv-worker", 2);
        let acceptor = iomanager("srv-accept", 1);
        let server = TcpServer::new(worker.clone(), acceptor.clone(), |mut stream: FiberStream| {
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        server.set_read_timeout(Some(Duration::from_secs(2)));
        let addr = server.bind(loopback()).unwrap();
        assert!(server.start());
        assert!(!server.start());

        for msg in [&b"ping"[..], b"fiberio"] {
            let mut client = std::net::TcpStream::connect(addr).unwrap();
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            client.write_all(msg).unwrap();
            let mut buf = vec![0u8; msg.len()];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(buf, msg);
        }

        server.stop();
        assert!(!server.is_running());
        acceptor.stop();
        worker.stop();
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_bind_all_reports_failures() {
        let server = TcpServer::new(iomanager("bind-w", 1), iomanager("bind-a", 1), |_s: FiberStream| {});
        let taken = std::net::TcpListener::bind(loopback()).unwrap();
        let busy = taken.local_addr().unwrap();
        assert_eq!(server.bind_all(&[loopback(), busy]), Err(vec![busy]));
        assert_eq!(server.bind_all(&[loopback()]).unwrap().len(), 1);
        server.worker.stop();
        server.accept_worker.stop();
    }
}
