//! # fiberio-hook - blocking-style I/O on fibers
//!
//! Fibers call ordinary-looking, blocking socket functions. When a call would
//! block, the fiber is parked in the IoManager until the descriptor is ready
//! or its timeout fires, and the worker thread runs other fibers meanwhile.
//!
//! ## Layers
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  net: FiberListener / FiberStream / TcpServer              │
//! │  stream: Stream trait, SocketStream                        │
//! └──────────────────────┬────────────────────────────────────┘
//!                        │ recv / send / accept / connect
//! ┌──────────────────────▼────────────────────────────────────┐
//! │  syscall: libc-shaped wrappers                             │
//! │    EAGAIN ─► IoManager::add_event + timer ─► yield_to_hold │
//! └──────────────────────┬────────────────────────────────────┘
//!                        │ per-fd flags and timeouts
//! ┌──────────────────────▼────────────────────────────────────┐
//! │  fd: FdCtx / FdManager                                     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Hook flag
//!
//! Suspension only happens on threads whose hook flag is on. Reactor workers
//! start with the process-wide default (on unless [`set_hook_default`] says
//! otherwise); any thread can override its own flag with
//! [`set_hook_enable`]. With the flag off every wrapper is its libc
//! namesake.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fiberio_hook::{Stream, TcpServer};
//! use fiberio_runtime::{IoManager, SchedulerConfig};
//!
//! let worker = IoManager::new(SchedulerConfig::new().name("worker").threads(4))?;
//! let acceptor = IoManager::new(SchedulerConfig::new().name("accept").threads(1))?;
//! let server = TcpServer::new(worker, acceptor, |stream: fiberio_hook::FiberStream| {
//!     let mut buf = [0u8; 4096];
//!     while let Ok(n @ 1..) = stream.read(&mut buf) {
//!         if stream.write_fix_size(&buf[..n]).is_err() {
//!             break;
//!         }
//!     }
//! });
//! server.bind("0.0.0.0:8080".parse()?)?;
//! server.start();
//! ```

pub mod fd;
pub mod net;
pub mod stream;
pub mod syscall;

pub use fd::{FdCtx, FdManager};
pub use net::{ClientHandler, FiberListener, FiberStream, TcpServer};
pub use stream::{SocketStream, Stream};
pub use syscall::{hook_default, is_hook_enable, set_hook_default, set_hook_enable};
