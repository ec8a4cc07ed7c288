//! Error taxonomy for the gateway core.
//!
//! Every fallible operation in the workspace returns [`GatewayError`]. The
//! taxonomy is deliberately flat: callers dispatch on [`GatewayError::kind`]
//! rather than on concrete variants, and the surrounding shells map kinds to
//! HTTP status codes via [`ErrorKind::http_status`].

use std::time::Duration;
use thiserror::Error;

/// Main error type for the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Spec parsing or validation failed, or the document requires external
    /// reference resolution (which is disabled).
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Missing required parameter, wrong location, unknown auth type.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Service, version, or operation absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Registration collided with an existing name.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Authentication required and credentials absent or invalid.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated but missing a required scope.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Rate limiter denied the call.
    #[error("rate limit exceeded, retry after {}s", retry_after.as_secs_f64())]
    RateLimited {
        /// Time until the next call would be admitted.
        retry_after: Duration,
    },

    /// Circuit breaker rejected the call without invoking the upstream.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        name: String,
        /// Estimated time until the breaker probes the upstream again.
        retry_after: Duration,
    },

    /// Call or upstream exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    /// Upstream network or protocol failure.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// Upstream returned a >= 400 status; the status is preserved so the
    /// proxy surface can propagate it unchanged.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Payload exceeded a configured ceiling.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unexpected state.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway core operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The kind of a [`GatewayError`], used for dispatch and wire formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidSpec,
    InvalidArg,
    NotFound,
    Duplicate,
    Unauthenticated,
    Forbidden,
    RateLimited,
    CircuitOpen,
    Timeout,
    Cancelled,
    Transport,
    UpstreamError,
    ResourceExhausted,
    Internal,
}

impl ErrorKind {
    /// Stable kebab-case name used in structured error payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidSpec => "invalid-spec",
            Self::InvalidArg => "invalid-arg",
            Self::NotFound => "not-found",
            Self::Duplicate => "duplicate",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate-limited",
            Self::CircuitOpen => "circuit-open",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Transport => "transport",
            Self::UpstreamError => "upstream-error",
            Self::ResourceExhausted => "resource-exhausted",
            Self::Internal => "internal",
        }
    }

    /// HTTP status code the proxy and control surfaces use for this kind.
    ///
    /// `upstream-error` has no fixed mapping: the original upstream status is
    /// preserved by the caller, so this returns 502 only as a fallback.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidSpec | Self::InvalidArg => 400,
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Duplicate => 409,
            Self::RateLimited => 429,
            Self::ResourceExhausted => 413,
            Self::CircuitOpen | Self::Timeout => 503,
            Self::Cancelled => 499,
            Self::Transport | Self::UpstreamError => 502,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GatewayError {
    /// The taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Self::InvalidArg(_) => ErrorKind::InvalidArg,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Upstream { .. } => ErrorKind::UpstreamError,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Retry hint carried by `rate-limited` and `circuit-open` errors.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// HTTP status the surfaces should answer with. Preserves the original
    /// status for `upstream-error`.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Upstream { status, .. } => *status,
            other => other.kind().http_status(),
        }
    }

    /// Structured `{ "error": kind, "message": … }` payload for the MCP
    /// surface.
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind().as_str(),
            "message": self.to_string(),
        })
    }
}
