//! Error types for the Askbox server.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Configuration-related errors (missing values, parse failures)
//! - [`ServerError`] - Request-level errors, each mapped to an HTTP response
//!
//! Component-specific errors live next to their components:
//! [`AuthError`](crate::auth::AuthError) for gate construction and
//! [`HubError`](crate::broadcast::HubError) for viewer registration. The core
//! operations themselves report outcomes as booleans and never error.
//!
//! # Example
//!
//! ```rust
//! use askbox_server::error::ServerError;
//!
//! fn validate_question(text: &str) -> Result<(), ServerError> {
//!     if text.trim().is_empty() {
//!         return Err(ServerError::validation("Question cannot be empty"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(validate_question("  ").is_err());
//! ```

use std::error::Error;
use std::fmt;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Errors that occur during configuration loading and validation.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required configuration value is missing.
    #[error("missing required configuration: {0}")]
    Missing(String),

    /// A configuration value failed to parse or is invalid.
    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid {
        /// The configuration key that has an invalid value.
        key: String,
        /// Description of why the value is invalid.
        reason: String,
    },

    /// Failed to read the configuration file.
    #[error("failed to load configuration file: {0}")]
    FileError(String),

    /// The configuration file is not valid TOML for the expected schema.
    #[error("failed to parse configuration file: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Creates a new missing configuration error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use askbox_server::error::ConfigError;
    ///
    /// let err = ConfigError::missing("admin.password");
    /// assert!(matches!(err, ConfigError::Missing(_)));
    /// ```
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing(key.into())
    }

    /// Creates a new invalid configuration error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use askbox_server::error::ConfigError;
    ///
    /// let err = ConfigError::invalid("PORT", "must be a number between 1 and 65535");
    /// assert!(matches!(err, ConfigError::Invalid { .. }));
    /// ```
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new file error.
    pub fn file_error(message: impl Into<String>) -> Self {
        Self::FileError(message.into())
    }

    /// Creates a new parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }
}

/// Top-level error type for request handling.
///
/// Every variant maps to one HTTP status in its [`IntoResponse`] impl.
/// Messages are returned to the client verbatim.
#[derive(Debug)]
pub enum ServerError {
    /// The request lacks valid admin credentials.
    ///
    /// Deliberately carries no detail: callers must not learn whether a
    /// token was expired, forged or the password was wrong.
    Unauthorized,

    /// Request validation failure, such as an empty question.
    Validation(String),

    /// The requested resource does not exist.
    NotFound(String),

    /// The client exceeded its question allowance.
    RateLimit {
        /// Identity that was denied.
        identity: String,
        /// Seconds until a token is available again.
        retry_after: u64,
        /// Configured questions per hour.
        limit: u32,
    },

    /// A bounded resource is exhausted (e.g. the viewer limit).
    Unavailable(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::RateLimit {
                identity,
                retry_after,
                ..
            } => {
                write!(
                    f,
                    "rate limit exceeded for {identity}, retry after {retry_after} seconds"
                )
            }
            Self::Unavailable(msg) => write!(f, "service unavailable: {msg}"),
        }
    }
}

impl Error for ServerError {}

impl ServerError {
    /// Creates a new validation error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use askbox_server::error::ServerError;
    ///
    /// let err = ServerError::validation("Missing required fields");
    /// assert!(matches!(err, ServerError::Validation(_)));
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a new rate limit error.
    ///
    /// # Arguments
    ///
    /// * `identity` - Identifier for the rate-limited client
    /// * `retry_after` - Seconds until the client can retry
    /// * `limit` - Configured questions per hour
    ///
    /// # Example
    ///
    /// ```rust
    /// use askbox_server::error::ServerError;
    ///
    /// let err = ServerError::rate_limit("192.168.1.1", 720, 5);
    /// assert!(matches!(err, ServerError::RateLimit { .. }));
    /// ```
    pub fn rate_limit(identity: impl Into<String>, retry_after: u64, limit: u32) -> Self {
        Self::RateLimit {
            identity: identity.into(),
            retry_after,
            limit,
        }
    }

    /// Creates a new unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Standard JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResponse {
    pub error: String,
    /// Seconds until the client may retry.
    pub retry_after: u64,
    /// Questions allowed per period.
    pub limit: u32,
    pub period: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::RateLimit {
                retry_after, limit, ..
            } => {
                let body = RateLimitResponse {
                    error: "Rate limit exceeded".to_owned(),
                    retry_after,
                    limit,
                    period: "hour".to_owned(),
                };
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            Self::Unauthorized => {
                (status, Json(ErrorResponse::new("unauthorized").with_code("unauthorized")))
                    .into_response()
            }
            Self::Validation(msg) => {
                (status, Json(ErrorResponse::new(msg).with_code("invalid_request"))).into_response()
            }
            Self::NotFound(what) => {
                (status, Json(ErrorResponse::new(format!("{what} not found")).with_code("not_found")))
                    .into_response()
            }
            Self::Unavailable(msg) => {
                (status, Json(ErrorResponse::new(msg).with_code("unavailable"))).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn config_error_missing_displays_correctly() {
        let err = ConfigError::missing("admin.password");
        assert_eq!(err.to_string(), "missing required configuration: admin.password");
    }

    #[test]
    fn config_error_invalid_displays_correctly() {
        let err = ConfigError::invalid("PORT", "must be a positive integer");
        assert_eq!(
            err.to_string(),
            "invalid configuration value for 'PORT': must be a positive integer"
        );
    }

    #[test]
    fn config_error_parse_displays_correctly() {
        let err = ConfigError::parse("expected `=`");
        assert_eq!(err.to_string(), "failed to parse configuration file: expected `=`");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ServerError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServerError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServerError::not_found("question").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ServerError::rate_limit("1.2.3.4", 60, 5).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ServerError::unavailable("full").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn rate_limit_response_has_header_and_body() {
        let response = ServerError::rate_limit("1.2.3.4", 720, 5).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "720");

        let body = body_json(response).await;
        assert_eq!(body["error"], "Rate limit exceeded");
        assert_eq!(body["retryAfter"], 720);
        assert_eq!(body["limit"], 5);
        assert_eq!(body["period"], "hour");
    }

    #[tokio::test]
    async fn unauthorized_response_carries_no_detail() {
        let response = ServerError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_json(response).await;
        assert_eq!(body["error"], "unauthorized");
        assert_eq!(body["code"], "unauthorized");
    }

    #[tokio::test]
    async fn unavailable_response_keeps_message() {
        let response = ServerError::unavailable("viewer limit reached").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["error"], "viewer limit reached");
        assert_eq!(body["code"], "unavailable");
    }
}
