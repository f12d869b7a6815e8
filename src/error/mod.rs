//! Gateway Error Handling
//!
//! One error type crosses every layer of the pipeline. Each variant maps to a
//! canonical `(error_source, error_code)` pair surfaced to clients and audit
//! records, plus an HTTP status for the outer transport.

use thiserror::Error;

/// Where a failure originated, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Client,
    Policy,
    Upstream,
    Gateway,
}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Policy => write!(f, "policy"),
            Self::Upstream => write!(f, "upstream"),
            Self::Gateway => write!(f, "gateway"),
        }
    }
}

/// Quota kinds tracked per api key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Token,
    Request,
    Cost,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token => write!(f, "token"),
            Self::Request => write!(f, "request"),
            Self::Cost => write!(f, "cost"),
        }
    }
}

/// Unified gateway error type.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    // -- client --
    #[error("{0}")]
    BadRequest(String),

    #[error("request body of {actual} bytes exceeds limit of {limit} bytes")]
    RequestTooLarge { limit: usize, actual: usize },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    // -- policy --
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("{kind} quota exceeded")]
    QuotaExceeded { kind: QuotaKind },

    #[error("source ip {ip} is not allowed")]
    IpNotAllowed { ip: String },

    #[error("model {model} is not allowed for this key")]
    ModelNotAllowed { model: String },

    // -- upstream --
    #[error("upstream timed out after {elapsed_ms}ms")]
    UpstreamTimeout { elapsed_ms: u64 },

    #[error("upstream returned {status}: {message}")]
    Upstream4xx { status: u16, message: String },

    #[error("upstream returned {status}: {message}")]
    Upstream5xx { status: u16, message: String },

    #[error("upstream stream broke after {frames} frames")]
    UpstreamStreamBroken { frames: u64 },

    #[error("circuit open for host {host}")]
    UpstreamCircuitOpen { host: String },

    #[error("outbound host {host} is not allowed")]
    UpstreamDomainNotAllowed { host: String },

    // -- gateway --
    #[error("no available upstream for model {model}")]
    NoAvailableUpstream { model: String },

    #[error("template render failed: {0}")]
    TemplateRenderFailed(String),

    #[error("step {step} timed out")]
    StepTimeout { step: String },

    #[error("{0}")]
    Internal(String),

    // -- infrastructure, reported as gateway/INTERNAL --
    #[error("kv store error: {0}")]
    Kv(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Canonical error code string for responses and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::RequestTooLarge { .. } => "REQUEST_TOO_LARGE",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::IpNotAllowed { .. } => "IP_NOT_ALLOWED",
            Self::ModelNotAllowed { .. } => "MODEL_NOT_ALLOWED",
            Self::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            Self::Upstream4xx { .. } => "UPSTREAM_4XX",
            Self::Upstream5xx { .. } => "UPSTREAM_5XX",
            Self::UpstreamStreamBroken { .. } => "UPSTREAM_STREAM_BROKEN",
            Self::UpstreamCircuitOpen { .. } => "UPSTREAM_CIRCUIT_OPEN",
            Self::UpstreamDomainNotAllowed { .. } => "UPSTREAM_DOMAIN_NOT_ALLOWED",
            Self::NoAvailableUpstream { .. } => "NO_AVAILABLE_UPSTREAM",
            Self::TemplateRenderFailed(_) => "TEMPLATE_RENDER_FAILED",
            Self::StepTimeout { .. } => "STEP_TIMEOUT",
            Self::Internal(_)
            | Self::Kv(_)
            | Self::Repository(_)
            | Self::Http(_)
            | Self::Parse(_)
            | Self::Cancelled => "INTERNAL",
        }
    }

    /// The error source bucket this error belongs to.
    pub fn source(&self) -> ErrorSource {
        match self {
            Self::BadRequest(_)
            | Self::RequestTooLarge { .. }
            | Self::Unauthorized(_)
            | Self::Forbidden(_)
            | Self::NotFound(_) => ErrorSource::Client,
            Self::RateLimited { .. }
            | Self::QuotaExceeded { .. }
            | Self::IpNotAllowed { .. }
            | Self::ModelNotAllowed { .. } => ErrorSource::Policy,
            Self::UpstreamTimeout { .. }
            | Self::Upstream4xx { .. }
            | Self::Upstream5xx { .. }
            | Self::UpstreamStreamBroken { .. }
            | Self::UpstreamCircuitOpen { .. }
            | Self::UpstreamDomainNotAllowed { .. } => ErrorSource::Upstream,
            _ => ErrorSource::Gateway,
        }
    }

    /// HTTP status the transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::RequestTooLarge { .. } => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_)
            | Self::IpNotAllowed { .. }
            | Self::ModelNotAllowed { .. }
            | Self::QuotaExceeded { .. } => 403,
            Self::NotFound(_) => 404,
            Self::RateLimited { .. } => 429,
            Self::UpstreamTimeout { .. } => 504,
            Self::Upstream4xx { .. }
            | Self::Upstream5xx { .. }
            | Self::UpstreamStreamBroken { .. }
            | Self::UpstreamCircuitOpen { .. }
            | Self::UpstreamDomainNotAllowed { .. }
            | Self::NoAvailableUpstream { .. } => 502,
            _ => 500,
        }
    }

    /// Whether the upstream caller may retry this error against the next
    /// failover candidate. Only meaningful before the first response byte.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout { .. }
                | Self::Upstream5xx { .. }
                | Self::Http(_)
                | Self::UpstreamCircuitOpen { .. }
        ) || matches!(self, Self::Upstream4xx { status, .. } if *status == 429)
    }

    /// Seconds the client should wait before retrying, when known.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result alias used across the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::UpstreamTimeout { elapsed_ms: 0 }
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(GatewayError::RateLimited { retry_after: 3 }.code(), "RATE_LIMITED");
        assert_eq!(
            GatewayError::QuotaExceeded { kind: QuotaKind::Token }.source(),
            ErrorSource::Policy
        );
        assert_eq!(GatewayError::UpstreamTimeout { elapsed_ms: 10 }.status_code(), 504);
        assert_eq!(GatewayError::Internal("x".into()).code(), "INTERNAL");
    }

    #[test]
    fn retryability_follows_whitelist() {
        assert!(GatewayError::Upstream5xx { status: 503, message: String::new() }.is_retryable());
        assert!(GatewayError::Upstream4xx { status: 429, message: String::new() }.is_retryable());
        assert!(!GatewayError::Upstream4xx { status: 400, message: String::new() }.is_retryable());
        assert!(!GatewayError::UpstreamStreamBroken { frames: 3 }.is_retryable());
    }
}
