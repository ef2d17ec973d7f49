//! Error types for the remote API clients.

use std::time::Duration;
use thiserror::Error;

/// Longest body fragment carried inside an error message.
const BODY_FRAGMENT_LEN: usize = 600;

/// Classified failure of a sandbox-provider or edge API call.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request was malformed or rejected by validation (HTTP 400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials (HTTP 401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credentials valid but insufficient (HTTP 403).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The addressed resource does not exist (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// A poll loop elapsed before the resource reached the wanted state.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Any other remote failure, carrying the HTTP status.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The request never produced an HTTP response (DNS, TLS, connect, ...).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ApiError {
    /// Classify a non-success HTTP response by status code.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message: String = body.chars().take(BODY_FRAGMENT_LEN).collect();
        match status.as_u16() {
            400 => ApiError::BadRequest(message),
            401 => ApiError::Unauthorized(message),
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            s => ApiError::Server { status: s, message },
        }
    }

    /// True for absent-resource failures, which cleanup paths tolerate.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

/// Result type alias for remote API calls.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_statuses() {
        let cases = [
            (400, "bad request"),
            (401, "unauthorized"),
            (403, "forbidden"),
            (404, "not found"),
        ];
        for (code, prefix) in cases {
            let status = reqwest::StatusCode::from_u16(code).unwrap();
            let err = ApiError::from_status(status, "boom");
            assert!(
                err.to_string().starts_with(prefix),
                "{code} -> {err}"
            );
        }
    }

    #[test]
    fn everything_else_is_server() {
        let status = reqwest::StatusCode::from_u16(502).unwrap();
        let err = ApiError::from_status(status, "upstream died");
        assert_eq!(err.to_string(), "server error (502): upstream died");
    }

    #[test]
    fn body_fragment_is_bounded() {
        let status = reqwest::StatusCode::from_u16(500).unwrap();
        let err = ApiError::from_status(status, &"x".repeat(10_000));
        assert!(err.to_string().len() < 700);
    }

    #[test]
    fn not_found_is_tolerable() {
        assert!(ApiError::NotFound("gone".into()).is_not_found());
        assert!(!ApiError::BadRequest("nope".into()).is_not_found());
    }
}
