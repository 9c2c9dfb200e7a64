//! Typed error definitions for Lexsync.
//!
//! This module provides a structured error hierarchy with specific error types
//! for different domains. All errors are designed to be:
//!
//! - **Serializable** for surfacing across the UI boundary via serde
//! - **Displayable** for logging via Display trait
//! - **Matchable** for error handling logic via enum variants
//! - **Composable** via thiserror derive macros

mod cache;
mod endpoint;
mod sync;

pub use cache::CacheError;
pub use endpoint::EndpointError;
pub use sync::SyncError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type that wraps all domain-specific errors.
///
/// Use this when you need a single error type that can represent
/// any Lexsync error.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "domain", content = "error")]
pub enum TypedError {
    /// Wraps a local-cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Wraps an endpoint-resolution error
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Wraps a synchronization error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Standard Result type using TypedError.
pub type Result<T> = std::result::Result<T, TypedError>;
