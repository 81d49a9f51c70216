//! The uniform response envelope written for every HTTP outcome.
//!
//! Body shape is `{ "error": bool, "response": any }`. Every envelope carries
//! the same CORS headers, bound to the single configured origin.

use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::error::DispatchError;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// JSON body of every HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub error: bool,
    pub response: Value,
}

/// An envelope plus the status and origin it is written with.
#[derive(Debug)]
pub struct EnvelopeResponse {
    status: StatusCode,
    body: Envelope,
    origin: HeaderValue,
}

impl EnvelopeResponse {
    /// A 200 response carrying the handler's result.
    #[must_use]
    pub fn success(result: Value, origin: &HeaderValue) -> Self {
        Self {
            status: StatusCode::OK,
            body: Envelope {
                error: false,
                response: result,
            },
            origin: origin.clone(),
        }
    }

    /// The error response for a failed request.
    #[must_use]
    pub fn failure(err: &DispatchError, origin: &HeaderValue) -> Self {
        Self {
            status: err.status(),
            body: Envelope {
                error: true,
                response: err.client_body(),
            },
            origin: origin.clone(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for EnvelopeResponse {
    fn into_response(self) -> Response {
        let body = match serde_json::to_vec(&self.body) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "Failed to serialize response envelope");
                br#"{"error":true,"response":false}"#.to_vec()
            }
        };

        (
            self.status,
            [
                (
                    ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                ),
                (ACCESS_CONTROL_ALLOW_ORIGIN, self.origin),
                (CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE)),
            ],
            body,
        )
            .into_response()
    }
}
