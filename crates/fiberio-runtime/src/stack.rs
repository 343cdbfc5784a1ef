//! Fiber stacks
//!
//! Each stack is a private anonymous mapping with a `PROT_NONE` guard page
//! at its low end, so an overflow faults instead of silently corrupting the
//! neighbouring allocation:
//!
//! ```text
//! base                 base + GUARD_SIZE                    top
//!  │ guard (PROT_NONE) │ usable stack (grows down) ◀─────── │
//! ```
//!
//! Physical pages are committed on first touch (`MAP_NORESERVE`).
//! Released stacks go back to a bounded [`StackPool`] after `MADV_DONTNEED`
//! drops their resident pages.

use crossbeam_queue::ArrayQueue;
use fiberio_core::constants::{GUARD_SIZE, MIN_STACK_SIZE};
use fiberio_core::error::{SchedResult, StackError};
use fiberio_core::kwarn;
use std::sync::OnceLock;

/// Maximum number of idle stacks kept for reuse
const POOL_CAPACITY: usize = 256;

/// An mmap-backed fiber stack with a guard page
pub struct Stack {
    base: *mut u8,
    /// Usable size, excluding the guard page
    size: usize,
}

// Safety: the mapping is owned exclusively by this value
unsafe impl Send for Stack {}

impl Stack {
    /// Map a new stack with `size` usable bytes (rounded up to whole pages)
    pub fn new(size: usize) -> SchedResult<Stack> {
        let size = round_to_page(size.max(MIN_STACK_SIZE)).ok_or(StackError::InvalidSize)?;
        let total = size.checked_add(GUARD_SIZE).ok_or(StackError::InvalidSize)?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocationFailed.into());
        }

        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe {
                libc::munmap(base, total);
            }
            return Err(StackError::ProtectionFailed.into());
        }

        Ok(Stack {
            base: base as *mut u8,
            size,
        })
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Highest address of the stack; the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // Safety: base + GUARD_SIZE + size is one past the end of the mapping
        unsafe { self.base.add(GUARD_SIZE + self.size) }
    }

    /// Lowest usable address (just above the guard page)
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(GUARD_SIZE) }
    }

    /// Release resident pages; the mapping stays valid and reads back zeros
    pub fn discard(&self) -> SchedResult<()> {
        let ret = unsafe {
            libc::madvise(
                self.bottom() as *mut libc::c_void,
                self.size,
                libc::MADV_DONTNEED,
            )
        };
        if ret != 0 {
            return Err(StackError::AdviseFailed.into());
        }
        Ok(())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size + GUARD_SIZE);
        }
    }
}

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    })
}

fn round_to_page(size: usize) -> Option<usize> {
    let page = page_size();
    size.checked_add(page - 1).map(|s| s & !(page - 1))
}

/// Bounded free list of stacks awaiting reuse
pub struct StackPool {
    free: ArrayQueue<Stack>,
}

impl StackPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// The process-wide pool used by fibers
    pub fn global() -> &'static StackPool {
        static POOL: OnceLock<StackPool> = OnceLock::new();
        POOL.get_or_init(|| StackPool::new(POOL_CAPACITY))
    }

    /// Take a stack of at least `size` usable bytes
    ///
    /// Pooled stacks of a different size (the configured default may have
    /// changed since they were created) are unmapped.
    pub fn acquire(&self, size: usize) -> SchedResult<Stack> {
        let wanted = round_to_page(size.max(MIN_STACK_SIZE)).ok_or(StackError::InvalidSize)?;
        while let Some(stack) = self.free.pop() {
            if stack.size() == wanted {
                return Ok(stack);
            }
        }
        Stack::new(wanted)
    }

    /// Return a stack for reuse, or unmap it when the pool is full
    pub fn release(&self, stack: Stack) {
        if let Err(e) = stack.discard() {
            kwarn!("dropping stack instead of pooling it: {}", e);
            return;
        }
        // A full pool hands the stack back and it is unmapped here
        let _ = self.free.push(stack);
    }

    /// Number of idle stacks
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alloc() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert_eq!(stack.size(), 64 * 1024);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, 64 * 1024);
        assert_eq!(stack.top() as usize % 16, 0);

        // Whole usable range is writable
        unsafe {
            *stack.bottom() = 1;
            *stack.top().sub(1) = 2;
        }
    }

    #[test]
    fn test_stack_minimum_and_rounding() {
        let stack = Stack::new(1).unwrap();
        assert_eq!(stack.size(), MIN_STACK_SIZE);

        let stack = Stack::new(MIN_STACK_SIZE + 1).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() > MIN_STACK_SIZE);
    }

    #[test]
    fn test_stack_discard_zeroes() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        unsafe { *stack.bottom() = 0xAB };
        stack.discard().unwrap();
        assert_eq!(unsafe { *stack.bottom() }, 0);
    }

    #[test]
    fn test_pool_reuse() {
        let pool = StackPool::new(2);
        let stack = pool.acquire(32 * 1024).unwrap();
        let addr = stack.top();
        pool.release(stack);
        assert_eq!(pool.len(), 1);

        let again = pool.acquire(32 * 1024).unwrap();
        assert_eq!(again.top(), addr);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_size_mismatch() {
        let pool = StackPool::new(2);
        pool.release(Stack::new(32 * 1024).unwrap());
        let stack = pool.acquire(64 * 1024).unwrap();
        assert_eq!(stack.size(), 64 * 1024);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_bounded() {
        let pool = StackPool::new(1);
        pool.release(Stack::new(MIN_STACK_SIZE).unwrap());
        pool.release(Stack::new(MIN_STACK_SIZE).unwrap());
        assert_eq!(pool.len(), 1);
    }
}
