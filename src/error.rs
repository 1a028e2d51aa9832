//! Gateway error taxonomy.
//!
//! Every recoverable failure in the request path maps to one of these kinds,
//! which in turn maps to an HTTP status and a JSON envelope of the form
//! `{"error": "...", "details": "..."}` (details only where they carry
//! information safe to expose). Configuration and server lifecycle errors
//! have their own types; this taxonomy is the client-facing surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Client-facing error kinds produced by the request pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No configured route matched the request path.
    #[error("resource not found")]
    NotFound,

    /// Authentication was required but absent or malformed.
    #[error("{reason}")]
    Unauthorized {
        /// What was wrong with the credentials presentation.
        reason: String,
    },

    /// The caller is authenticated but not permitted.
    #[error("forbidden")]
    Forbidden,

    /// The bearer token failed signature or structural validation.
    #[error("invalid token")]
    InvalidToken,

    /// The bearer token is past its `exp` claim.
    #[error("token expired")]
    TokenExpired,

    /// The bearer token was signed with the right key but the wrong issuer.
    #[error("invalid issuer")]
    InvalidIssuer,

    /// A token bucket denied the request.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The request deadline elapsed before the upstream completed.
    #[error("request timeout")]
    Timeout,

    /// The circuit breaker for the upstream is open.
    #[error("upstream service unavailable")]
    UpstreamUnavailable,

    /// All forwarding attempts failed at the transport level.
    #[error("failed to forward request")]
    BadGateway {
        /// Last transport error observed, surfaced for operators.
        details: String,
    },

    /// The service is refusing traffic (breaker open, draining).
    #[error("service temporarily unavailable")]
    ServiceUnavailable,

    /// Configuration could not be applied.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Unexpected fault caught by the recovery stage.
    #[error("internal server error")]
    Internal,
}

impl GatewayError {
    /// The HTTP status this kind maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized { .. }
            | Self::InvalidToken
            | Self::TokenExpired
            | Self::InvalidIssuer => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable | Self::ServiceUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::ConfigInvalid(_) | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, used in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "ERR_NOT_FOUND",
            Self::Unauthorized { .. } => "ERR_UNAUTHORIZED",
            Self::Forbidden => "ERR_FORBIDDEN",
            Self::InvalidToken => "ERR_INVALID_TOKEN",
            Self::TokenExpired => "ERR_TOKEN_EXPIRED",
            Self::InvalidIssuer => "ERR_INVALID_ISSUER",
            Self::RateLimited => "ERR_RATE_LIMITED",
            Self::Timeout => "ERR_TIMEOUT",
            Self::UpstreamUnavailable => "ERR_UPSTREAM_UNAVAILABLE",
            Self::BadGateway { .. } => "ERR_BAD_GATEWAY",
            Self::ServiceUnavailable => "ERR_SERVICE_UNAVAILABLE",
            Self::ConfigInvalid(_) => "ERR_CONFIG_INVALID",
            Self::Internal => "ERR_INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = match &self {
            GatewayError::BadGateway { details } if !details.is_empty() => {
                json!({ "error": self.to_string(), "details": details })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(GatewayError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::InvalidIssuer.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(GatewayError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::UpstreamUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::BadGateway { details: String::new() }.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayError::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_gateway_carries_details() {
        let err = GatewayError::BadGateway {
            details: "connection refused".to_string(),
        };
        assert_eq!(err.code(), "ERR_BAD_GATEWAY");
        assert_eq!(err.to_string(), "failed to forward request");
    }

    #[test]
    fn unauthorized_reason_is_the_message() {
        let err = GatewayError::Unauthorized {
            reason: "missing authorization header".to_string(),
        };
        assert_eq!(err.to_string(), "missing authorization header");
    }
}
