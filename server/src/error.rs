//! Error types for the Gatehouse server.
//!
//! This module defines the error hierarchy shared by both dispatch engines.
//! Every per-request failure is converted at the dispatcher boundary into a
//! status code and the uniform response envelope; only [`ConfigError`] is
//! allowed to end the process, and only during startup.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Startup configuration problems (fatal)
//! - [`HandlerError`] - Failure reported by an external route handler
//! - [`DispatchError`] - Terminal outcome of a failed HTTP request
//!
//! # Example
//!
//! ```rust
//! use axum::http::StatusCode;
//! use gatehouse_server::error::DispatchError;
//!
//! let err = DispatchError::PayloadTooLarge;
//! assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
//! ```

use axum::http::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthError;
use crate::schema::ValidationError;

/// Errors that occur during configuration loading and validation.
///
/// These are fatal: the server refuses to start.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(String),
}

impl ConfigError {
    /// Creates a new missing configuration error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use gatehouse_server::error::ConfigError;
    ///
    /// let err = ConfigError::missing("GATEHOUSE_ORIGIN");
    /// assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    /// ```
    pub fn missing(var: impl Into<String>) -> Self {
        Self::MissingEnvVar(var.into())
    }

    /// Creates a new invalid format error.
    pub fn invalid(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            var: var.into(),
            message: message.into(),
        }
    }
}

/// Failure reported by an external route handler.
///
/// The message is only ever logged. Clients see `response: false`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{err:#}"))
    }
}

/// Terminal outcome of an HTTP request that did not reach a successful
/// handler result.
///
/// Each variant maps to exactly one status code via [`DispatchError::status`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Accumulated request body exceeded the size cap.
    #[error("request body exceeds the size limit")]
    PayloadTooLarge,

    /// The request body did not arrive within the configured time.
    #[error("timed out receiving request body")]
    BodyTimeout,

    /// Reading the request body failed at the transport level.
    #[error("failed to read request body: {0}")]
    BodyRead(String),

    /// No route is registered for the method and path.
    #[error("no route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The body of a non-GET request is not valid JSON.
    #[error("malformed JSON payload: {0}")]
    MalformedJson(String),

    /// The route requires authentication and the caller is not authenticated.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The route declares a schema but the request carried no payload.
    #[error("payload required by route schema is missing")]
    MissingPayload,

    /// The payload did not satisfy the route schema.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The external handler failed or did not finish in time.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl DispatchError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BodyTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Auth(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BodyRead(_) | Self::MalformedJson(_) | Self::MissingPayload | Self::Handler(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    /// Returns the client-visible `response` value for this error.
    ///
    /// Only validation failures expose a message; everything else is `false`.
    #[must_use]
    pub fn client_body(&self) -> Value {
        match self {
            Self::Validation(err) => Value::String(err.to_string()),
            _ => Value::Bool(false),
        }
    }
}
