//! Bridge configuration.
//!
//! Timeouts default to the values in [`Defaults`]; everything can be
//! overridden in code or, through [`BridgeConfig::from_env`], by environment.

use std::time::Duration;

use tracing::warn;

/// Default values for [`BridgeConfig`].
pub struct Defaults;

impl Defaults {
    /// Single round-trip requests (get, inspect, serialize, blob, keys).
    pub const IPC_TIMEOUT: Duration = Duration::from_secs(10);
    /// Calls, constructions and assignments.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
    /// Module loading and event waits, which can legitimately take minutes.
    pub const LONG_CALL_TIMEOUT: Duration = Duration::from_secs(900);
    /// How often the loop sends the batched free requests.
    pub const FREE_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

    pub const DEBUG_ENV: &'static str = "EXOBRIDGE_DEBUG";
    pub const LEGACY_SHIMS_ENV: &'static str = "EXOBRIDGE_LEGACY_SHIMS";
    pub const IPC_TIMEOUT_ENV: &'static str = "EXOBRIDGE_IPC_TIMEOUT_MS";
    pub const CALL_TIMEOUT_ENV: &'static str = "EXOBRIDGE_CALL_TIMEOUT_MS";
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Trace every frame in and out.
    pub debug: bool,
    /// Whether callbacks registered through [`crate::events`] receive the
    /// emitter as an explicit first argument. `None` lets
    /// [`crate::Bridge::connect`] ask the remote side.
    pub legacy_emitter_shims: Option<bool>,
    pub ipc_timeout: Duration,
    pub call_timeout: Duration,
    pub long_call_timeout: Duration,
    pub free_flush_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            legacy_emitter_shims: None,
            ipc_timeout: Defaults::IPC_TIMEOUT,
            call_timeout: Defaults::CALL_TIMEOUT,
            long_call_timeout: Defaults::LONG_CALL_TIMEOUT,
            free_flush_interval: Defaults::FREE_FLUSH_INTERVAL,
        }
    }
}

impl BridgeConfig {
    /// Reads overrides from the process environment.
    ///
    /// Debug logging is on when `EXOBRIDGE_DEBUG` is set to anything but `0`,
    /// or when `DEBUG` mentions `exobridge`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let flag = |value: Option<String>| value.map(|v| v != "0" && !v.eq_ignore_ascii_case("false"));
        let millis = |name: &str| lookup(name).and_then(|value| parse_millis(name, &value));

        config.debug = flag(lookup(Defaults::DEBUG_ENV)).unwrap_or(false)
            || lookup("DEBUG").is_some_and(|v| v.contains("exobridge"));
        config.legacy_emitter_shims = flag(lookup(Defaults::LEGACY_SHIMS_ENV));
        if let Some(timeout) = millis(Defaults::IPC_TIMEOUT_ENV) {
            config.ipc_timeout = timeout;
        }
        if let Some(timeout) = millis(Defaults::CALL_TIMEOUT_ENV) {
            config.call_timeout = timeout;
        }
        config
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_legacy_emitter_shims(mut self, enabled: bool) -> Self {
        self.legacy_emitter_shims = Some(enabled);
        self
    }

    pub fn with_ipc_timeout(mut self, timeout: Duration) -> Self {
        self.ipc_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_long_call_timeout(mut self, timeout: Duration) -> Self {
        self.long_call_timeout = timeout;
        self
    }

    pub fn with_free_flush_interval(mut self, interval: Duration) -> Self {
        self.free_flush_interval = interval;
        self
    }
}

fn parse_millis(name: &str, value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!(variable = name, value, error = %e, "ignoring unparsable timeout, keeping the default");
            None
        }
    }
}
