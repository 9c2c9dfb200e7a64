//! Shared utilities: HTTP client construction, clock injection, tracing init.

pub mod clock;
pub mod http;
pub mod logging;
