//! Local-cache errors.
//!
//! These never escape `LocalCache` to its callers — the cache degrades to a
//! miss on every failure — but they are logged and carried by the store
//! boundary, so they are typed here like every other domain.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur inside the local TTL cache.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum CacheError {
    /// Underlying key-value store operation failed
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure
        message: String,
    },

    /// Stored entry failed to parse as a cache envelope
    #[error("Corrupt cache entry: {key}")]
    Corrupt {
        /// Namespaced key of the offending entry
        key: String,
    },

    /// Value could not be serialized into a cache envelope
    #[error("Serialization error: {message}")]
    Serialize {
        /// Description of the serde failure
        message: String,
    },
}
