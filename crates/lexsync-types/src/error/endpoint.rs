//! Endpoint-resolution errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during endpoint discovery and health probing.
///
/// The resolver itself is fail-open and never surfaces these to callers of
/// `best_url()`; they exist for logging and for the probe internals.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum EndpointError {
    /// Health probe reached the endpoint but got a non-success status
    #[error("Health probe rejected by {url}: status {status}")]
    ProbeRejected {
        /// URL that was probed
        url: String,
        /// HTTP status returned by the health route
        status: u16,
    },

    /// Health probe failed at the transport level
    #[error("Health probe failed for {url}: {message}")]
    ProbeFailed {
        /// URL that was probed
        url: String,
        /// Transport-level failure description
        message: String,
    },

    /// Health probe exceeded its deadline
    #[error("Health probe timed out after {timeout_ms}ms")]
    Timeout {
        /// Probe deadline in milliseconds
        timeout_ms: u64,
    },

    /// HTTP client could not be constructed
    #[error("HTTP client build failed: {message}")]
    ClientBuild {
        /// Builder failure description
        message: String,
    },
}
