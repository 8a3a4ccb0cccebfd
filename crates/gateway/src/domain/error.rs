//! Gateway error types with HTTP status and JSON-RPC 2.0 code mappings.

use axum::http::StatusCode;

/// Standard JSON-RPC 2.0 error codes
pub mod rpc_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Client-visible request error.
///
/// Every failure a client can observe maps onto one of these kinds; the
/// HTTP surface converts them to a status code with the message as body,
/// the WebSocket surface to a JSON-RPC error object.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Unknown endpoint or file
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid credentials
    #[error("unauthorized")]
    Unauthorized,

    /// Malformed arguments or request shape
    #[error("{0}")]
    BadRequest(String),

    /// The request deadline elapsed before the host replied
    #[error("request timed out")]
    Timeout,

    /// The host link is down or the host is not ready
    #[error("Klippy host not connected")]
    HostDisconnected,

    /// The host processed the request and returned an error
    #[error("{0}")]
    Host(String),

    /// Unexpected gateway-side failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error kind
    pub fn http_status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::HostDisconnected => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout | ApiError::Host(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// JSON-RPC 2.0 error code for this error kind
    pub fn rpc_code(&self) -> i32 {
        match self {
            ApiError::NotFound(_) => rpc_codes::METHOD_NOT_FOUND,
            ApiError::BadRequest(_) => rpc_codes::INVALID_PARAMS,
            ApiError::Unauthorized
            | ApiError::Timeout
            | ApiError::HostDisconnected
            | ApiError::Host(_)
            | ApiError::Internal(_) => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Result type for client-facing operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Gateway bootstrap/infrastructure errors (not client-visible)
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Server socket bind error
    #[error("bind error: {0}")]
    Bind(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            ApiError::NotFound("x".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::Unauthorized.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::HostDisconnected.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Timeout.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rpc_code_mapping() {
        assert_eq!(
            ApiError::NotFound("x".into()).rpc_code(),
            rpc_codes::METHOD_NOT_FOUND
        );
        assert_eq!(
            ApiError::BadRequest("x".into()).rpc_code(),
            rpc_codes::INVALID_PARAMS
        );
        assert_eq!(ApiError::Timeout.rpc_code(), rpc_codes::INTERNAL_ERROR);
        assert_eq!(ApiError::Host("boom".into()).rpc_code(), rpc_codes::INTERNAL_ERROR);
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(ApiError::Timeout.to_string(), "request timed out");
    }
}
