//! Byte streams over hooked descriptors

use crate::syscall;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Bidirectional byte stream
///
/// `read`/`write` transfer at most `buf.len()` bytes and return `Ok(0)` once
/// the peer has closed.
pub trait Stream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Read exactly `buf.len()` bytes
    ///
    /// Returns `Ok(0)` if the peer closed before the buffer was filled.
    fn read_fix_size(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.read(&mut buf[offset..])? {
                0 => return Ok(0),
                n => offset += n,
            }
        }
        Ok(offset)
    }

    /// Write all of `buf`
    ///
    /// Returns `Ok(0)` if the peer stopped accepting data first.
    fn write_fix_size(&self, buf: &[u8]) -> io::Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.write(&buf[offset..])? {
                0 => return Ok(0),
                n => offset += n,
            }
        }
        Ok(offset)
    }

    fn close(&self);
}

/// [`Stream`] over a socket descriptor
pub struct SocketStream {
    fd: RawFd,
    owner: bool,
    closed: AtomicBool,
}

impl SocketStream {
    /// Take ownership of `fd`; it is closed with the stream
    pub fn new(fd: RawFd) -> SocketStream {
        SocketStream {
            fd,
            owner: true,
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap `fd` without taking ownership
    pub fn borrowed(fd: RawFd) -> SocketStream {
        SocketStream {
            fd,
            owner: false,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Shut down one or both directions without releasing the descriptor
    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        let how = match how {
            std::net::Shutdown::Read => libc::SHUT_RD,
            std::net::Shutdown::Write => libc::SHUT_WR,
            std::net::Shutdown::Both => libc::SHUT_RDWR,
        };
        if unsafe { libc::shutdown(self.fd, how) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Stream for SocketStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_connected() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let n = unsafe { syscall::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_connected() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let n = unsafe { syscall::send(self.fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.owner {
            syscall::close(self.fd);
        }
    }
}

impl Drop for SocketStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketStream")
            .field("fd", &self.fd)
            .field("owner", &self.owner)
            .field("connected", &self.is_connected())
            .finish()
    }
}
