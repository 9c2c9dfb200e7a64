//! Endpoint discovery and health-checked URL caching.
//!
//! The resolver is an explicit instance with injected dependencies (clock,
//! HTTP client, discovery strategy) — never module-level state — so several
//! independent resolvers can coexist and be unit-tested without shared
//! global mutation.
//!
//! Fail-open is the governing principle: a failed or timed-out probe still
//! returns the primary URL so the caller's own request surfaces the real
//! error, instead of the resolver silently blocking every consumer.

use std::sync::Arc;
use std::time::Duration;

use lexsync_types::{EndpointError, EndpointHealth};

use crate::config::{DEFAULT_HEALTH_CHECK_INTERVAL_MS, DEFAULT_PROBE_TIMEOUT_MS};
use crate::utils::clock::Clock;
use crate::utils::http::create_client;

/// Compiled-in last-resort base URL.
const DEFAULT_API_URL: &str = "https://api.lexsync.app";

/// Pluggable platform-specific discovery strategy (emulator host rewriting,
/// mDNS, config service — the resolver does not care).
pub type DiscoveryFn = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Resolver tunables.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// How long a healthy verdict is reused without re-probing
    pub health_check_interval_ms: i64,
    /// Deadline for one `GET /health` probe
    pub probe_timeout_ms: u64,
    /// Skip probing entirely (offline builds, unit tests of callers)
    pub skip_verification: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            skip_verification: false,
        }
    }
}

/// Discovers and validates the reachable API endpoint, caching the verdict
/// for a bounded interval.
pub struct EndpointResolver {
    configured_url: Option<String>,
    discovery: Option<DiscoveryFn>,
    fallback_url: String,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    options: ResolverOptions,
    health: tokio::sync::RwLock<Option<EndpointHealth>>,
    /// Serializes probes so concurrent `best_url()` callers share one.
    probe_gate: tokio::sync::Mutex<()>,
}

impl EndpointResolver {
    pub fn new(
        configured_url: Option<String>,
        options: ResolverOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EndpointError> {
        let client = create_client(10)?;
        Ok(Self {
            configured_url,
            discovery: None,
            fallback_url: DEFAULT_API_URL.to_string(),
            client,
            clock,
            options,
            health: tokio::sync::RwLock::new(None),
            probe_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_discovery(mut self, discovery: DiscoveryFn) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_fallback(mut self, url: impl Into<String>) -> Self {
        self.fallback_url = url.into();
        self
    }

    /// The URL the resolver would use before any health verification:
    /// configured value, then `LEXSYNC_API_URL`, then the discovery
    /// strategy, then the compiled-in default.
    pub fn primary_url(&self) -> String {
        if let Some(url) = &self.configured_url {
            return url.clone();
        }
        if let Ok(url) = std::env::var("LEXSYNC_API_URL") {
            if !url.is_empty() {
                return url;
            }
        }
        if let Some(discover) = &self.discovery {
            if let Some(url) = discover() {
                return url;
            }
        }
        self.fallback_url.clone()
    }

    /// Best-known base URL. Zero I/O while a healthy verdict is fresh; at
    /// most one probe in flight per resolver regardless of caller count;
    /// fail-open on probe failure.
    pub async fn best_url(&self) -> String {
        if let Some(url) = self.cached_url().await {
            return url;
        }

        let _gate = self.probe_gate.lock().await;
        // Another caller may have finished the probe while we waited.
        if let Some(url) = self.cached_url().await {
            return url;
        }

        let primary = self.primary_url();
        if self.options.skip_verification {
            return primary;
        }

        match self.probe(&primary).await {
            Ok(()) => {
                let verdict = EndpointHealth {
                    url: primary.clone(),
                    last_checked_at: self.clock.now_ms(),
                    healthy: true,
                };
                *self.health.write().await = Some(verdict);
                tracing::debug!(url = %primary, "endpoint verified healthy");
                primary
            }
            Err(err) => {
                tracing::warn!(url = %primary, error = %err, "health probe failed; failing open to primary URL");
                *self.health.write().await = None;
                primary
            }
        }
    }

    /// Clear the cached verdict and resolve again.
    pub async fn refresh(&self) -> String {
        self.clear_cache().await;
        self.best_url().await
    }

    /// Reset cached health state without resolving.
    pub async fn clear_cache(&self) {
        *self.health.write().await = None;
    }

    /// Current cached verdict, if any (for diagnostics and tests).
    pub async fn cached_health(&self) -> Option<EndpointHealth> {
        self.health.read().await.clone()
    }

    async fn cached_url(&self) -> Option<String> {
        let now = self.clock.now_ms();
        let interval = self.options.health_check_interval_ms;
        let health = self.health.read().await;
        health.as_ref().filter(|h| h.is_fresh(now, interval)).map(|h| h.url.clone())
    }

    /// One bounded probe. Dropping the request future on timeout aborts the
    /// underlying connection attempt.
    async fn probe(&self, url: &str) -> Result<(), EndpointError> {
        let deadline = Duration::from_millis(self.options.probe_timeout_ms);
        let request = self.client.get(format!("{}/health", url.trim_end_matches('/'))).send();

        match tokio::time::timeout(deadline, request).await {
            Err(_) => Err(EndpointError::Timeout { timeout_ms: self.options.probe_timeout_ms }),
            Ok(Err(e)) => {
                Err(EndpointError::ProbeFailed { url: url.to_string(), message: e.to_string() })
            }
            Ok(Ok(resp)) if resp.status().is_success() => Ok(()),
            Ok(Ok(resp)) => Err(EndpointError::ProbeRejected {
                url: url.to_string(),
                status: resp.status().as_u16(),
            }),
        }
    }
}
