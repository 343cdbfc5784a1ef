//! Kernel-style print macros for fiberio
//!
//! Thread-safe, optionally-flushing diagnostics on stderr, similar to
//! Linux's printk. Every leveled line is tagged with the OS thread name and
//! the id of the fiber that emitted it:
//!
//! ```text
//! [INFO]  [iom-worker-0 f=12] accepted fd=9
//! ```
//!
//! # Environment Variables
//!
//! - `FIO_FLUSH_EPRINT=1` - Flush stderr after each print (useful for debugging crashes)
//! - `FIO_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `FIO_LOG_TIME=1` - Prefix lines with milliseconds since logging started
//!
//! # Usage
//!
//! ```ignore
//! use fiberio_core::{kinfo, kwarn, kassert};
//!
//! kinfo!("worker {} started", id);
//! kwarn!("unexpected state: {:?}", state);
//! kassert!(fd >= 0, "bad descriptor {}", fd);
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown strings yield `None`
    pub fn parse(s: &str) -> Option<Self> {
        let level = match s.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => return None,
        };
        Some(level)
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static START: OnceLock<Instant> = OnceLock::new();

thread_local! {
    /// Fiber running on this thread, maintained by the runtime on every switch
    static FIBER_ID: Cell<u64> = const { Cell::new(0) };
}

/// Initialize logging from environment variables
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    START.get_or_init(Instant::now);

    let truthy = |key: &str| {
        std::env::var(key)
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    };
    FLUSH_ENABLED.store(truthy("FIO_FLUSH_EPRINT"), Ordering::Relaxed);
    TIME_ENABLED.store(truthy("FIO_LOG_TIME"), Ordering::Relaxed);

    if let Ok(val) = std::env::var("FIO_LOG_LEVEL") {
        let level = LogLevel::parse(&val).unwrap_or(LogLevel::Info);
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Set flush mode programmatically
pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Enable or disable the elapsed-time prefix
pub fn set_time_enabled(enabled: bool) {
    init();
    TIME_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Record the fiber now running on this thread (0 for none)
#[inline]
pub fn set_fiber_id(id: u64) {
    FIBER_ID.with(|c| c.set(id));
}

#[inline]
pub fn fiber_id() -> u64 {
    FIBER_ID.with(|c| c.get())
}

fn write_context(handle: &mut impl Write) {
    if TIME_ENABLED.load(Ordering::Relaxed) {
        let elapsed = START.get_or_init(Instant::now).elapsed();
        let _ = write!(handle, "{:>8}ms ", elapsed.as_millis());
    }
    let thread = std::thread::current();
    let _ = write!(
        handle,
        "[{} f={}] ",
        thread.name().unwrap_or("?"),
        fiber_id()
    );
}

/// Write one record under the stderr lock, flushing when configured
fn emit(f: impl FnOnce(&mut std::io::StderrLock<'static>)) {
    let mut out = std::io::stderr().lock();
    f(&mut out);
    if flush_enabled() {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    emit(|out| {
        let _ = out.write_fmt(args);
    });
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    emit(|out| {
        let _ = writeln!(out, "{}", args);
    });
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(|out| {
            let _ = write!(out, "{} ", level.prefix());
            write_context(&mut *out);
            let _ = writeln!(out, "{}", args);
        });
    }
}

/// Log a fatal invariant violation with a backtrace, then abort
#[doc(hidden)]
#[cold]
pub fn _kfatal_impl(args: std::fmt::Arguments<'_>) -> ! {
    let backtrace = std::backtrace::Backtrace::force_capture();
    let mut out = std::io::stderr().lock();
    let _ = write!(out, "{} ", LogLevel::Error.prefix());
    write_context(&mut out);
    let _ = writeln!(out, "FATAL: {}\nbacktrace:\n{}", args, backtrace);
    let _ = out.flush();
    drop(out);
    std::process::abort()
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*));
    }};
}

/// Print to stderr with newline
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprintln_impl(format_args!($($arg)*));
    }};
}

/// Error level log (always shown unless logging is off)
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

/// Fatal invariant violation: log with backtrace and abort the process
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {
        $crate::kprint::_kfatal_impl(format_args!($($arg)*))
    };
}

/// Abort via `kfatal!` when the condition does not hold
#[macro_export]
macro_rules! kassert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::kfatal!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::kfatal!(
                "assertion failed: {}: {}",
                stringify!($cond),
                format_args!($($arg)+)
            );
        }
    };
}

// ============================================================================
// Tests
// ============================================================================
