//! Domain models for the Lexsync synchronization layer.
//!
//! Everything here is serde-serializable: records and stats round-trip
//! through the local cache as JSON envelopes, and events cross the realtime
//! transport boundary.

mod event;
mod record;

pub use event::{ChangeEvent, ChangeEventType, SubscriptionScope};
pub use record::{CollectionStats, MutationIntent, RecordPatch, SyncState, SyncedRecord};

use serde::{Deserialize, Serialize};

/// Cached health verdict for a resolved endpoint.
///
/// Owned exclusively by the `EndpointResolver`; at most one live instance per
/// resolver. A healthy verdict is only reused while it is younger than the
/// resolver's health-check interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHealth {
    /// Base URL that was probed
    pub url: String,
    /// Unix millis of the last completed probe
    pub last_checked_at: i64,
    /// Whether the last probe succeeded
    pub healthy: bool,
}

impl EndpointHealth {
    /// Whether this verdict is still usable at `now_ms` given the interval.
    pub fn is_fresh(&self, now_ms: i64, interval_ms: i64) -> bool {
        self.healthy && now_ms.saturating_sub(self.last_checked_at) < interval_ms
    }
}
