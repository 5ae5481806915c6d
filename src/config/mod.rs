//! Typed engine configuration.
//!
//! Periodic engines are configured in milliseconds, either from a TOML table
//! or from environment variables sharing a prefix. Values are validated on
//! load so a bad interval fails before the engine is ever started.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Delay before the first tick after each start.
pub const DEFAULT_FIRST_DELAY: Duration = Duration::from_secs(1);

/// Schedule and shutdown settings for a periodic engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicConfig {
    /// Delay after one execution completes before the next one fires.
    pub interval: Duration,
    /// Delay before the first execution after a start.
    pub first_delay: Duration,
    /// Upper bound on waiting for in-flight work during shutdown.
    /// `None` waits for as long as the work takes.
    pub drain_timeout: Option<Duration>,
}

impl PeriodicConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            first_delay: DEFAULT_FIRST_DELAY,
            drain_timeout: None,
        }
    }

    pub fn first_delay(mut self, first_delay: Duration) -> Self {
        self.first_delay = first_delay;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Parse a TOML document of the form
    ///
    /// ```toml
    /// interval_ms = 5000
    /// first_delay_ms = 1000   # optional
    /// drain_timeout_ms = 30000 # optional
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let raw: RawPeriodicConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid periodic config: {e}")))?;
        raw.try_into()
    }

    /// Load from `{prefix}_INTERVAL_MS` (required), `{prefix}_FIRST_DELAY_MS`
    /// and `{prefix}_DRAIN_TIMEOUT_MS`.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let interval = std::env::var(format!("{prefix}_INTERVAL_MS")).map_err(|_| {
            Error::Config(format!(
                "required environment variable {prefix}_INTERVAL_MS is not set"
            ))
        })?;
        let raw = RawPeriodicConfig {
            interval_ms: parse_ms(&format!("{prefix}_INTERVAL_MS"), &interval)?,
            first_delay_ms: optional_ms(&format!("{prefix}_FIRST_DELAY_MS"))?,
            drain_timeout_ms: optional_ms(&format!("{prefix}_DRAIN_TIMEOUT_MS"))?,
        };
        raw.try_into()
    }
}

/// On-disk shape of [`PeriodicConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPeriodicConfig {
    interval_ms: u64,
    #[serde(default)]
    first_delay_ms: Option<u64>,
    #[serde(default)]
    drain_timeout_ms: Option<u64>,
}

impl TryFrom<RawPeriodicConfig> for PeriodicConfig {
    type Error = Error;

    fn try_from(raw: RawPeriodicConfig) -> Result<Self> {
        if raw.interval_ms == 0 {
            return Err(Error::Config("interval_ms must be greater than zero".to_string()));
        }
        if raw.drain_timeout_ms == Some(0) {
            return Err(Error::Config(
                "drain_timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        Ok(Self {
            interval: Duration::from_millis(raw.interval_ms),
            first_delay: raw
                .first_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FIRST_DELAY),
            drain_timeout: raw.drain_timeout_ms.map(Duration::from_millis),
        })
    }
}

fn parse_ms(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a whole number of milliseconds, got {value:?}")))
}

fn optional_ms(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => parse_ms(name, &value).map(Some),
        Err(_) => Ok(None),
    }
}

/// Telemetry settings read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub service_name: String,
}

impl TelemetrySettings {
    /// Reads `OTEL_ENDPOINT`, `LOG_LEVEL` (default `info`) and `SERVICE_NAME`
    /// (default `engines-rs`). Nothing is required.
    pub fn from_env() -> Self {
        Self {
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "engines-rs".to_string()),
        }
    }
}
