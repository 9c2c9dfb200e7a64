//! Tunables for the synchronization layer.

use serde::{Deserialize, Serialize};

/// Default collection cache TTL: 5 minutes.
pub const DEFAULT_TTL_MS: i64 = 5 * 60 * 1000;
/// Default endpoint health re-check interval: 60 seconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: i64 = 60 * 1000;
/// Default health probe deadline: 3 seconds.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;
/// Default change-feed debounce window: 300 milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
/// Default cache namespace prefix.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "lexsync:";

/// Runtime configuration for the sync layer.
///
/// Serde-compatible so embedders can persist it; `from_env()` applies the
/// `LEXSYNC_*` environment overrides on top of the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// TTL applied to cache entries when the caller passes none
    pub default_ttl_ms: i64,
    /// How long a healthy endpoint verdict is reused without re-probing
    pub health_check_interval_ms: i64,
    /// Deadline for one health probe
    pub probe_timeout_ms: u64,
    /// Quiet period before a burst of change events fires one notification
    pub debounce_ms: u64,
    /// Prefix under which all cache keys live in the persistent store
    pub namespace_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_TTL_MS,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
        }
    }
}

impl SyncConfig {
    /// Defaults with `LEXSYNC_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<i64>("LEXSYNC_CACHE_TTL_MS") {
            config.default_ttl_ms = v;
        }
        if let Some(v) = env_parse::<i64>("LEXSYNC_HEALTH_INTERVAL_MS") {
            config.health_check_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("LEXSYNC_PROBE_TIMEOUT_MS") {
            config.probe_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("LEXSYNC_DEBOUNCE_MS") {
            config.debounce_ms = v;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
