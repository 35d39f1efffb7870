//! Explicit protocol-vs-transport error classification for upstream calls.
//!
//! The circuit breaker tracks availability: a well-formed JSON-RPC error
//! from the upstream means the upstream answered, so it must not count
//! against it. Timeouts, failed sends, closed transports, spawn and
//! handshake failures do.

use rmcp::ServiceError;

use relay_core::error::RouterError;

/// Map one upstream service error into the router taxonomy.
pub fn map_service_error(upstream: &str, error: ServiceError) -> RouterError {
    match error {
        // The upstream processed the request and returned a structured
        // error (unknown tool, invalid arguments, ...).
        ServiceError::McpError(data) => {
            RouterError::Protocol(format!("upstream '{upstream}': {}", data.message))
        }
        ServiceError::TransportSend(_) | ServiceError::TransportClosed => {
            RouterError::UpstreamUnavailable(format!("upstream '{upstream}': transport failed"))
        }
        // Unknown kinds are treated as availability failures; the breaker
        // would rather trip than mask a dying upstream.
        other => RouterError::UpstreamUnavailable(format!("upstream '{upstream}': {other}")),
    }
}

/// Router error raised when an operation exceeded its deadline.
pub fn timeout_error(upstream: &str, timeout_ms: u64) -> RouterError {
    RouterError::UpstreamUnavailable(format!(
        "upstream '{upstream}': timed out after {timeout_ms}ms"
    ))
}

/// Router error for spawn/connect failures.
pub fn connect_error(upstream: &str, detail: impl std::fmt::Display) -> RouterError {
    RouterError::UpstreamUnavailable(format!("upstream '{upstream}': {detail}"))
}
