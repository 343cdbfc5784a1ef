//! Runtime configuration
//!
//! Two layers:
//!
//! - [`ConfigVar`]: process-wide tunables read at the moment they are
//!   needed (fiber creation, connect, server accept, reactor poll), so a
//!   `set` takes effect for every operation armed afterwards without
//!   restarting anything. Listeners observe changes.
//! - [`SchedulerConfig`]: construction-time settings of one scheduler.
//!
//! Every value has an environment override (`FIO_*`).

use fiberio_core::constants::{DEFAULT_STACK_SIZE, MAX_WORKERS};
use fiberio_core::env::{env_get, env_get_bool, env_get_str};
use fiberio_core::{kinfo, SchedError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No variable registered under this name
    UnknownKey(String),

    /// Value out of range for the variable
    InvalidValue { key: String, value: u64 },

    /// Scheduler settings rejected by `validate`
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownKey(key) => write!(f, "unknown config key '{}'", key),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value {} for '{}'", value, key)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for SchedError {
    fn from(e: ConfigError) -> Self {
        SchedError::InvalidConfig(e.to_string())
    }
}

type Listener = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A named, hot-reloadable numeric setting
pub struct ConfigVar {
    name: &'static str,
    description: &'static str,
    env_key: &'static str,
    default: u64,
    value: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

impl ConfigVar {
    fn new(name: &'static str, env_key: &'static str, default: u64, description: &'static str) -> Self {
        Self {
            name,
            description,
            env_key,
            default,
            value: AtomicU64::new(env_get(env_key, default)),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Current value interpreted as milliseconds
    #[inline]
    pub fn get_duration(&self) -> Duration {
        Duration::from_millis(self.get())
    }

    /// Replace the value and notify listeners if it changed
    pub fn set(&self, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                key: self.name.to_string(),
                value,
            });
        }
        let old = self.value.swap(value, Ordering::AcqRel);
        if old != value {
            kinfo!("config {} changed {} -> {}", self.name, old, value);
            // Listeners run outside the lock so they may touch the var
            let listeners: Vec<Listener> = match self.listeners.lock() {
                Ok(guard) => guard.iter().map(|(_, l)| Arc::clone(l)).collect(),
                Err(poisoned) => poisoned.get_ref().iter().map(|(_, l)| Arc::clone(l)).collect(),
            };
            for listener in listeners {
                listener(old, value);
            }
        }
        Ok(())
    }

    /// Register a change listener called with `(old, new)`; returns its key
    pub fn add_listener<F>(&self, f: F) -> u64
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        let key = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        listeners.push((key, Arc::new(f)));
        key
    }

    /// Remove a listener; returns `false` if the key was unknown
    pub fn remove_listener(&self, key: u64) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        let before = listeners.len();
        listeners.retain(|(k, _)| *k != key);
        listeners.len() != before
    }

    /// Re-read the environment override, falling back to the default
    fn reload_from_env(&self) -> Result<(), ConfigError> {
        self.set(env_get(self.env_key, self.default))
    }
}

impl fmt::Debug for ConfigVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &self.get())
            .finish()
    }
}

struct Registry {
    fiber_stack_size: ConfigVar,
    tcp_connect_timeout: ConfigVar,
    tcp_server_read_timeout: ConfigVar,
    reactor_max_timeout: ConfigVar,
}

impl Registry {
    fn all(&self) -> [&ConfigVar; 4] {
        [
            &self.fiber_stack_size,
            &self.tcp_connect_timeout,
            &self.tcp_server_read_timeout,
            &self.reactor_max_timeout,
        ]
    }
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        fiber_stack_size: ConfigVar::new(
            "fiber.stack_size",
            "FIO_FIBER_STACK_SIZE",
            DEFAULT_STACK_SIZE as u64,
            "fiber stack size in bytes",
        ),
        tcp_connect_timeout: ConfigVar::new(
            "tcp.connect.timeout",
            "FIO_TCP_CONNECT_TIMEOUT",
            5000,
            "tcp connect timeout in ms",
        ),
        tcp_server_read_timeout: ConfigVar::new(
            "tcp_server.read_timeout",
            "FIO_TCP_SERVER_READ_TIMEOUT",
            2 * 60 * 1000,
            "tcp server read timeout in ms",
        ),
        reactor_max_timeout: ConfigVar::new(
            "reactor.max_timeout_ms",
            "FIO_REACTOR_MAX_TIMEOUT",
            5000,
            "upper bound of one reactor poll in ms",
        ),
    })
}

/// Default stack size for new fibers
pub fn fiber_stack_size() -> &'static ConfigVar {
    &registry().fiber_stack_size
}

/// Timeout applied by hooked `connect`
pub fn tcp_connect_timeout() -> &'static ConfigVar {
    &registry().tcp_connect_timeout
}

/// Receive timeout applied to sockets accepted by the TCP server
pub fn tcp_server_read_timeout() -> &'static ConfigVar {
    &registry().tcp_server_read_timeout
}

/// Longest single reactor poll
pub fn reactor_max_timeout() -> &'static ConfigVar {
    &registry().reactor_max_timeout
}

/// Find a variable by its dotted name
pub fn lookup(name: &str) -> Option<&'static ConfigVar> {
    registry().all().into_iter().find(|v| v.name == name)
}

/// Set a variable by its dotted name
pub fn set(name: &str, value: u64) -> Result<(), ConfigError> {
    lookup(name)
        .ok_or_else(|| ConfigError::UnknownKey(name.to_string()))?
        .set(value)
}

/// Re-read every variable from the environment
pub fn reload_from_env() -> Result<(), ConfigError> {
    registry().all().into_iter().try_for_each(ConfigVar::reload_from_env)
}

/// Configuration for one scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total threads running the scheduler loop, including the caller
    /// when `use_caller` is set
    pub threads: usize,

    /// Whether the constructing thread takes part in scheduling
    pub use_caller: bool,

    /// Name used for worker threads and logs
    pub name: String,

    /// Longest sleep of an idle cooperative worker between queue checks
    pub park_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            use_caller: false,
            name: "fiberio".to_string(),
            park_timeout: Duration::from_millis(10),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `FIO_THREADS`, `FIO_USE_CALLER`, `FIO_NAME`, `FIO_PARK_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            threads: env_get("FIO_THREADS", d.threads),
            use_caller: env_get_bool("FIO_USE_CALLER", d.use_caller),
            name: env_get_str("FIO_NAME", &d.name),
            park_timeout: Duration::from_millis(env_get(
                "FIO_PARK_TIMEOUT_MS",
                d.park_timeout.as_millis() as u64,
            )),
        }
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, yes: bool) -> Self {
        self.use_caller = yes;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    /// Worker threads to spawn, excluding a participating caller
    pub fn spawned_threads(&self) -> usize {
        if self.use_caller {
            self.threads.saturating_sub(1)
        } else {
            self.threads
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be at least 1"));
        }
        if self.threads > MAX_WORKERS {
            return Err(ConfigError::Invalid("threads exceeds maximum"));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::Invalid("park_timeout must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_defaults_registered() {
        assert!(lookup("fiber.stack_size").is_some());
        assert!(lookup("tcp.connect.timeout").is_some());
        assert!(lookup("tcp_server.read_timeout").is_some());
        assert!(lookup("reactor.max_timeout_ms").is_some());
        assert!(lookup("no.such.key").is_none());
    }

    #[test]
    fn test_set_unknown_and_zero() {
        assert_eq!(
            set("no.such.key", 1),
            Err(ConfigError::UnknownKey("no.such.key".to_string()))
        );
        assert!(matches!(
            set("tcp.connect.timeout", 0),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_listener_notified_on_change() {
        let var = ConfigVar::new("test.var", "__FIO_TEST_VAR__", 10, "test");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let key = var.add_listener(move |old, new| {
            assert_eq!((old, new), (10, 20));
            c.fetch_add(1, Ordering::SeqCst);
        });

        var.set(20).unwrap();
        var.set(20).unwrap(); // unchanged, no notification
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(var.get(), 20);

        assert!(var.remove_listener(key));
        assert!(!var.remove_listener(key));
        var.set(30).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("__FIO_TEST_OVERRIDE__", "77");
        let var = ConfigVar::new("test.override", "__FIO_TEST_OVERRIDE__", 5, "test");
        assert_eq!(var.get(), 77);
        std::env::remove_var("__FIO_TEST_OVERRIDE__");
        var.reload_from_env().unwrap();
        assert_eq!(var.get(), 5);
    }

    #[test]
    fn test_scheduler_config_builder() {
        let cfg = SchedulerConfig::new().threads(3).use_caller(true).name("io");
        assert_eq!(cfg.spawned_threads(), 2);
        assert_eq!(cfg.name, "io");
        assert!(cfg.validate().is_ok());

        assert!(SchedulerConfig::new().threads(0).validate().is_err());
        assert_eq!(SchedulerConfig::new().threads(2).spawned_threads(), 2);
    }
}
