//! HTTP client construction.

use lexsync_types::EndpointError;
use reqwest::Client;

/// Create an HTTP client with the given overall request timeout.
pub fn create_client(timeout_secs: u64) -> Result<Client, EndpointError> {
    base_builder(timeout_secs)
        .build()
        .map_err(|e| EndpointError::ClientBuild { message: e.to_string() })
}

/// Shared builder with keepalive settings.
fn base_builder(timeout_secs: u64) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .tcp_nodelay(true)
        .http2_keep_alive_interval(std::time::Duration::from_secs(25))
        .http2_keep_alive_timeout(std::time::Duration::from_secs(10))
        .http2_keep_alive_while_idle(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_client() {
        assert!(create_client(10).is_ok());
    }
}
