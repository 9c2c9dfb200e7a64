//! # Lexsync Types
//!
//! Core types, models, and error definitions for the Lexsync data
//! synchronization layer.
//!
//! This crate provides the foundational type system for the Lexsync client:
//!
//! - **`error`** - Typed error hierarchy for cache, endpoint, and sync domains
//! - **`models`** - Domain models (ChangeEvent, SyncedRecord, MutationIntent, ...)
//!
//! ## Architecture Role
//!
//! `lexsync-types` sits at the bottom of the dependency graph:
//!
//! ```text
//!         lexsync-types (this crate)
//!                 │
//!                 ▼
//!           lexsync-core
//!                 │
//!                 ▼
//!        application / UI glue
//! ```
//!
//! All types are designed to be:
//! - **Serializable** via serde for storage envelopes and IPC
//! - **Clone** for cheap sharing across async boundaries
//! - **PartialEq** for testing and comparison

pub mod error;
pub mod models;

// Re-export error types for convenience
pub use error::{CacheError, EndpointError, SyncError, TypedError};

// Re-export core model types
pub use models::{
    ChangeEvent, ChangeEventType, CollectionStats, EndpointHealth, MutationIntent, RecordPatch,
    SubscriptionScope, SyncState, SyncedRecord,
};
