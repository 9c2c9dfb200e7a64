//! Synced records, optimistic mutation intents, and derived stats.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Synchronization state of one cached record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Record matches the last authoritative server state
    #[default]
    Idle,
    /// Record carries a local mutation whose server round-trip is unresolved
    Optimistic,
    /// Record was just restored from a snapshot after a rejected mutation
    RolledBack,
}

/// The cached, possibly locally-mutated view of one business entity.
///
/// Consultations, appeals, and glossary terms are all instances of this one
/// shape: an id plus an open field map. The sync layer never interprets the
/// fields beyond the collection's configured status field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedRecord {
    /// Stable server-assigned identifier
    pub id: String,
    /// Entity fields as delivered by the server (plus local patches)
    pub fields: Map<String, Value>,
    /// Current sync state; defaults to `Idle` for records read from cache
    #[serde(default)]
    pub sync_state: SyncState,
}

impl SyncedRecord {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self { id: id.into(), fields, sync_state: SyncState::Idle }
    }

    /// String value of a field, if present and a string.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// A set of field overwrites targeting one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    /// Identifier of the record to mutate
    pub target_id: String,
    /// Fields to overwrite on the target
    pub fields: Map<String, Value>,
}

impl RecordPatch {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self { target_id: target_id.into(), fields: Map::new() }
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }
}

/// Bookkeeping for one applied-but-unconfirmed optimistic mutation.
///
/// Owned by the collection until confirmed (discarded) or rolled back
/// (consumed to restore `previous_snapshot`). `sequence` is a monotonic
/// counter assigned at apply time, never wall-clock, so superseded rollbacks
/// can be detected without clock-skew hazards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationIntent {
    /// Rollback token handed to the caller
    pub token: String,
    /// Identifier of the mutated record
    pub target_id: String,
    /// The applied field overwrites
    pub patch: Map<String, Value>,
    /// Full record as it was immediately before the patch
    pub previous_snapshot: SyncedRecord,
    /// Apply-time monotonic sequence number
    pub sequence: u64,
}

/// Derived aggregate state for a collection, recomputed after every load
/// and mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Total record count
    pub total: usize,
    /// Record count grouped by the collection's status field
    pub by_status: BTreeMap<String, usize>,
}

impl CollectionStats {
    /// Recompute counts from a record set, grouping by `status_field`.
    /// Records without the field land under `"unknown"`.
    pub fn compute(records: &[SyncedRecord], status_field: &str) -> Self {
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for record in records {
            let status = record.field_str(status_field).unwrap_or("unknown");
            *by_status.entry(status.to_string()).or_insert(0) += 1;
        }
        Self { total: records.len(), by_status }
    }
}
