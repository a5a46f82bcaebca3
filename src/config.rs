// Runtime configuration for the coordination service (§10.3).
//
// Mirrors the teacher's layered config: a TOML file provides defaults,
// `COORD_*` environment variables override individual fields, and the
// result is validated once at startup rather than re-checked on every
// read.

use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Address the gossip endpoint binds to.
    pub bind_address: SocketAddr,

    /// Seconds of silence before a session is declared dead.
    pub session_ttl_secs: u64,

    /// Initial backoff for a blocked lock wait, in milliseconds.
    pub min_backoff_millis: u64,

    /// Backoff ceiling for a blocked lock wait, in milliseconds.
    pub max_backoff_millis: u64,

    /// Maximum number of entries the per-session cache holds before it
    /// starts evicting the least recently touched ones.
    pub cache_capacity: usize,

    /// Times a `TransientIO` storage failure is retried before surfacing
    /// to the caller, via [`crate::storage::RetryingStorage`].
    pub io_retry_budget: u32,

    /// Prefix folded into the locally generated session tag, so sessions
    /// from independently configured clusters sharing a network segment
    /// never collide.
    pub multiplex_prefix: String,

    /// `RUST_LOG`-style filter directive for `tracing_subscriber`.
    pub log_filter: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7700".parse().unwrap(),
            session_ttl_secs: 30,
            min_backoff_millis: 200,
            max_backoff_millis: 12_800,
            cache_capacity: 4096,
            io_retry_budget: 5,
            multiplex_prefix: "coord".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl CoordinationConfig {
    /// Load defaults, overlay a TOML file if one exists at `path`, then
    /// overlay `COORD_*` environment variables. Matches the teacher's
    /// `DbConfig::load` precedence (file beats built-in default, env
    /// beats file).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        let path = path.as_ref();
        if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| {
                CoordinationError::Configuration(format!("reading {}: {e}", path.display()))
            })?;
            config = toml::from_str(&text).map_err(|e| {
                CoordinationError::Configuration(format!("parsing {}: {e}", path.display()))
            })?;
        }
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("COORD_BIND_ADDRESS") {
            self.bind_address = v.parse().map_err(|e| {
                CoordinationError::Configuration(format!("COORD_BIND_ADDRESS: {e}"))
            })?;
        }
        if let Ok(v) = std::env::var("COORD_SESSION_TTL_SECS") {
            self.session_ttl_secs = parse_env("COORD_SESSION_TTL_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("COORD_MIN_BACKOFF_MILLIS") {
            self.min_backoff_millis = parse_env("COORD_MIN_BACKOFF_MILLIS", &v)?;
        }
        if let Ok(v) = std::env::var("COORD_MAX_BACKOFF_MILLIS") {
            self.max_backoff_millis = parse_env("COORD_MAX_BACKOFF_MILLIS", &v)?;
        }
        if let Ok(v) = std::env::var("COORD_CACHE_CAPACITY") {
            self.cache_capacity = parse_env("COORD_CACHE_CAPACITY", &v)?;
        }
        if let Ok(v) = std::env::var("COORD_IO_RETRY_BUDGET") {
            self.io_retry_budget = parse_env("COORD_IO_RETRY_BUDGET", &v)?;
        }
        if let Ok(v) = std::env::var("COORD_MULTIPLEX_PREFIX") {
            self.multiplex_prefix = v;
        }
        if let Ok(v) = std::env::var("COORD_LOG_FILTER") {
            self.log_filter = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.min_backoff_millis == 0 {
            return Err(CoordinationError::Configuration(
                "min_backoff_millis must be nonzero".into(),
            ));
        }
        if self.max_backoff_millis < self.min_backoff_millis {
            return Err(CoordinationError::Configuration(
                "max_backoff_millis must be >= min_backoff_millis".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(CoordinationError::Configuration(
                "cache_capacity must be nonzero".into(),
            ));
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_millis)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_millis)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| CoordinationError::Configuration(format!("{name}: invalid value {raw:?}")))
}
