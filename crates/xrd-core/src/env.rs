//! Process-wide defaults and environment overrides.
//!
//! The defaults table seeds every tunable the stack consults at run time.
//! A process environment variable named `XRD_<KEY>` (upper-cased) overrides
//! the seeded default once, at first read. `put_*` calls override both.

use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tracing_subscriber::EnvFilter;

/// Well-known tunable names.
pub mod keys {
    /// Seconds a stream stays in its error window after address exhaustion.
    pub const CONNECTION_WINDOW: &str = "ConnectionWindow";
    /// Connection attempts before the stream gives up for the window.
    pub const CONNECTION_RETRY: &str = "ConnectionRetry";
    /// Default per-request expiry in seconds.
    pub const REQUEST_TIMEOUT: &str = "RequestTimeout";
    /// Socket inactivity timeout in seconds.
    pub const STREAM_TIMEOUT: &str = "StreamTimeout";
    /// Timer resolution for the task runner, in seconds.
    pub const TIMEOUT_RESOLUTION: &str = "TimeoutResolution";
    /// Worker threads in the job manager.
    pub const WORKER_THREADS: &str = "WorkerThreads";
    /// Channel tick cadence in seconds.
    pub const TICK_INTERVAL: &str = "TickInterval";
    /// Seconds an unclaimed in-queue message is retained.
    pub const ORPHAN_TTL: &str = "OrphanTtl";
    /// Maximum redirect hops for a single request.
    pub const REDIRECT_LIMIT: &str = "RedirectLimit";
}

fn default_ints() -> FxHashMap<String, i64> {
    let mut map = FxHashMap::default();
    map.insert(keys::CONNECTION_WINDOW.to_owned(), 120);
    map.insert(keys::CONNECTION_RETRY.to_owned(), 5);
    map.insert(keys::REQUEST_TIMEOUT.to_owned(), 1800);
    map.insert(keys::STREAM_TIMEOUT.to_owned(), 60);
    map.insert(keys::TIMEOUT_RESOLUTION.to_owned(), 1);
    map.insert(keys::WORKER_THREADS.to_owned(), 3);
    map.insert(keys::TICK_INTERVAL.to_owned(), 15);
    map.insert(keys::ORPHAN_TTL.to_owned(), 60);
    map.insert(keys::REDIRECT_LIMIT.to_owned(), 16);
    map
}

/// Defaults table with `XRD_*` environment overrides.
#[derive(Debug)]
pub struct Env {
    ints: Mutex<FxHashMap<String, i64>>,
    strings: Mutex<FxHashMap<String, String>>,
}

impl Env {
    /// Creates a table seeded with the stack defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ints: Mutex::new(default_ints()),
            strings: Mutex::new(FxHashMap::default()),
        }
    }

    /// Reads an integer tunable. Environment overrides win over seeded
    /// defaults; explicit [`Env::put_int`] wins over both.
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i64> {
        if let Some(value) = Self::env_override(key) {
            if let Ok(parsed) = value.parse() {
                return Some(parsed);
            }
            tracing::warn!(key, value, "ignoring unparsable environment override");
        }
        self.ints.lock().expect("env lock poisoned").get(key).copied()
    }

    /// Reads a string tunable.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        if let Some(value) = Self::env_override(key) {
            return Some(value);
        }
        self.strings
            .lock()
            .expect("env lock poisoned")
            .get(key)
            .cloned()
    }

    /// Sets an integer tunable, shadowing defaults and the environment.
    pub fn put_int(&self, key: &str, value: i64) {
        self.ints
            .lock()
            .expect("env lock poisoned")
            .insert(key.to_owned(), value);
    }

    /// Sets a string tunable.
    pub fn put_string(&self, key: &str, value: &str) {
        self.strings
            .lock()
            .expect("env lock poisoned")
            .insert(key.to_owned(), value.to_owned());
    }

    fn env_override(key: &str) -> Option<String> {
        let name = format!("XRD_{}", key.to_uppercase());
        std::env::var(name).ok()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

/// Instance tag from `XRDINSTANCE`, if set.
#[must_use]
pub fn instance_tag() -> Option<String> {
    std::env::var("XRDINSTANCE").ok()
}

/// Name-to-name plug-in path and parameters from `XRDN2NLIB` /
/// `XRDN2NPARMS`. The core records but does not load them; plug-in loading
/// belongs to the hosting application.
#[must_use]
pub fn n2n_plugin() -> Option<(String, String)> {
    let lib = std::env::var("XRDN2NLIB").ok()?;
    let parms = std::env::var("XRDN2NPARMS").unwrap_or_default();
    Some((lib, parms))
}

/// Installs the global tracing subscriber.
///
/// The base filter comes from `RUST_LOG` (default `info`); `XRDDEBUG=1`
/// raises it to `debug` and `XRDDEBUG=2` or higher to `trace`. Calling this
/// twice is harmless; the second installation is ignored.
pub fn init_tracing() {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match std::env::var("XRDDEBUG").ok().as_deref() {
            Some("0") | None => "info",
            Some("1") => "debug",
            Some(_) => "trace",
        };
        EnvFilter::new(level)
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(base)
        .with_target(true);

    if builder.try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
