//! Change-notification events and subscription scoping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of change delivered by the realtime transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
    /// Wildcard used by scopes that want every event type
    Any,
}

impl std::fmt::Display for ChangeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeEventType::Insert => write!(f, "insert"),
            ChangeEventType::Update => write!(f, "update"),
            ChangeEventType::Delete => write!(f, "delete"),
            ChangeEventType::Any => write!(f, "any"),
        }
    }
}

/// One change notification from the realtime transport.
///
/// Transient: produced by the transport, consumed exactly once by the
/// change-feed debouncer, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Entity table the change occurred in
    pub table: String,
    /// Kind of change
    pub event_type: ChangeEventType,
    /// Identifier of the affected record, when the transport provides one
    pub affected_id: Option<String>,
}

/// Identifies one logical change feed: an entity table plus an owner filter.
///
/// The filter is applied server-side by the transport when opening the feed;
/// `scope_key()` gives the canonical identity used for connection sharing and
/// reference counting. `BTreeMap` keeps the key deterministic regardless of
/// filter insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionScope {
    /// Entity table to watch
    pub table: String,
    /// Owner filter, e.g. `{"owner": "u1"}`
    pub filter: BTreeMap<String, String>,
}

impl SubscriptionScope {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), filter: BTreeMap::new() }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    /// Canonical key identifying this scope for connection sharing.
    pub fn scope_key(&self) -> String {
        let mut key = self.table.clone();
        for (k, v) in &self.filter {
            key.push_str(&format!(":{}={}", k, v));
        }
        key
    }

    /// Whether an incoming event belongs to this scope.
    ///
    /// The owner filter is enforced by the transport when the feed is opened,
    /// so local matching only has to check the table.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
    }
}
