/// JSON-RPC error codes the relay reports at the protocol boundary.
///
/// `-32602` (invalid params) is the standard JSON-RPC code; the rest live in
/// the implementation-defined `-32000..=-32099` range.
pub mod codes {
    pub const UNAUTHENTICATED: i32 = -32000;
    pub const FORBIDDEN: i32 = -32001;
    pub const RATE_LIMITED: i32 = -32002;
    pub const NO_PROVIDERS_MATCH: i32 = -32003;
    pub const UPSTREAM_UNAVAILABLE: i32 = -32004;
    pub const UPSTREAM_PROTOCOL: i32 = -32005;
    pub const BAD_REQUEST: i32 = -32602;
    pub const INTERNAL: i32 = -32603;
}

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: principal may not access upstream '{0}'")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no providers match selector '{0}'")]
    NoProvidersMatch(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// The JSON-RPC error code this error kind surfaces as.
    pub fn code(&self) -> i32 {
        match self {
            Self::ConfigInvalid(_) | Self::Internal(_) => codes::INTERNAL,
            Self::Unauthenticated(_) => codes::UNAUTHENTICATED,
            Self::Forbidden(_) => codes::FORBIDDEN,
            Self::BadRequest(_) => codes::BAD_REQUEST,
            Self::NoProvidersMatch(_) => codes::NO_PROVIDERS_MATCH,
            Self::UpstreamUnavailable(_) => codes::UPSTREAM_UNAVAILABLE,
            Self::Protocol(_) => codes::UPSTREAM_PROTOCOL,
            Self::RateLimited { .. } => codes::RATE_LIMITED,
        }
    }

    /// True when the failure counts against an upstream's availability.
    ///
    /// Protocol-level errors (unknown tool, bad arguments) mean the upstream
    /// answered; they must not trip the circuit breaker.
    pub fn counts_as_upstream_failure(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}
