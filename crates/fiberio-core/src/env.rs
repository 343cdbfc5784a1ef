//! Environment variable utilities
//!
//! All runtime knobs can be overridden from the environment (`FIO_*`
//! variables). Values that fail to parse fall back to the default rather
//! than aborting startup.
//!
//! ```ignore
//! use fiberio_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("FIO_THREADS", 4);
//! let use_caller = env_get_bool("FIO_USE_CALLER", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (any case) are true; any other value is false.
/// An unset variable returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable if set and parseable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as string, or return `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
