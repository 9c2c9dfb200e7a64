//! Synchronization errors surfaced by `SyncedCollection`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading or mutating a synced collection.
///
/// `NetworkUnavailable` and `RemoteRejected` are the two variants callers are
/// expected to handle; any necessary rollback has already been applied before
/// either is returned, so the caller never observes a half-mutated record.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum SyncError {
    /// Fetch failed at the transport level and no cached data was available
    #[error("Network unavailable: {message}")]
    NetworkUnavailable {
        /// Transport-level failure description
        message: String,
    },

    /// Fetch or acknowledgement exceeded its deadline
    #[error("Request timed out")]
    Timeout,

    /// Server rejected a mutation acknowledgement
    #[error("Remote rejected ({status}): {message}")]
    RemoteRejected {
        /// HTTP status of the rejection
        status: u16,
        /// Error body or message from the server
        message: String,
    },

    /// Stored cache entry failed to parse (treated as a miss upstream)
    #[error("Corrupt cache entry: {key}")]
    CacheCorrupt {
        /// Namespaced key of the offending entry
        key: String,
    },

    /// Realtime transport dropped the feed for a scope
    #[error("Subscription lost for scope: {scope}")]
    SubscriptionLost {
        /// Canonical scope key of the dropped feed
        scope: String,
    },

    /// A mutation targeted a record that is not in the collection
    #[error("Unknown record: {id}")]
    UnknownRecord {
        /// Identifier the patch targeted
        id: String,
    },
}

impl SyncError {
    /// Check if this is a temporary error that may resolve on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkUnavailable { .. } | Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        let transient = SyncError::Timeout;
        let permanent = SyncError::RemoteRejected { status: 422, message: "bad patch".to_string() };

        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
    }
}
