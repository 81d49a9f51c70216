//! The HTTP request dispatcher.
//!
//! Every request that is not the realtime endpoint runs through
//! [`Dispatcher::dispatch`], which walks a fixed sequence of stages. The first
//! stage to fail decides the response:
//!
//! | Stage | Failure | Status |
//! |-------|---------|--------|
//! | Receive body | larger than [`MAX_BODY_BYTES`] | 413 |
//! | Receive body | not complete within the body timeout | 408 |
//! | Route lookup | no route for method + path | 404 |
//! | Parse payload | non-GET body is not JSON | 400 |
//! | Auth check | route requires auth, cookie invalid | 403 |
//! | Validate | schema declared, payload absent or `null` | 400 |
//! | Validate | payload fails the schema | 422 |
//! | Invoke | handler error or handler timeout | 400 |
//!
//! Success is 200 with the handler's result. The caller wraps either outcome
//! in the response envelope.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::COOKIE;
use axum::http::{HeaderMap, Method, Uri};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::auth::IdentityValidator;
use crate::config::Config;
use crate::error::{DispatchError, HandlerError};
use crate::registry::RouteRegistry;

/// Request bodies larger than this are rejected with 413.
pub const MAX_BODY_BYTES: usize = 5120;

/// Runs requests against a fixed route registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<RouteRegistry>,
    validator: Arc<IdentityValidator>,
    cookie_name: String,
    body_timeout: Duration,
    handler_timeout: Duration,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<RouteRegistry>,
        validator: Arc<IdentityValidator>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            validator,
            cookie_name: config.cookie_name.clone(),
            body_timeout: config.body_timeout,
            handler_timeout: config.handler_timeout,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Runs one request through every stage.
    ///
    /// # Errors
    ///
    /// Returns the [`DispatchError`] of the first stage that fails.
    pub async fn dispatch(
        &self,
        method: Method,
        uri: Uri,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<Value, DispatchError> {
        let bytes = match timeout(self.body_timeout, receive_body(body, MAX_BODY_BYTES)).await {
            Ok(result) => result?,
            Err(_) => return Err(DispatchError::BodyTimeout),
        };

        let path = uri.path();
        let Some(route) = self.registry.lookup(&method, path) else {
            debug!(method = %method, path, "Mismatched endpoint");
            return Err(DispatchError::RouteNotFound {
                method: method.to_string(),
                path: path.to_string(),
            });
        };
        debug!(method = %method, path, "Handling route");

        let payload = parse_payload(&method, &bytes)?;

        let identity = if route.require_auth {
            let cookie_header = cookie_header(headers);
            match self
                .validator
                .authenticate(cookie_header.as_deref(), &self.cookie_name)
            {
                Ok(identity) => Some(identity),
                Err(err) => {
                    debug!(method = %method, path, reason = %err, "Authentication failed");
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        if let Some(schema) = &route.schema {
            // A literal `null` body carries no payload either.
            let Some(payload) = payload.as_ref().filter(|p| !p.is_null()) else {
                return Err(DispatchError::MissingPayload);
            };
            if let Err(err) = schema.validate(payload) {
                debug!(method = %method, path, error = %err, "Payload rejected by schema");
                return Err(err.into());
            }
        }

        match timeout(self.handler_timeout, (route.handler)(identity, payload)).await {
            Ok(Ok(result)) => {
                debug!(method = %method, path, "Handler succeeded");
                Ok(result)
            }
            Ok(Err(err)) => {
                warn!(method = %method, path, error = %err, "Handler failed");
                Err(err.into())
            }
            Err(_) => {
                warn!(
                    method = %method,
                    path,
                    timeout_secs = self.handler_timeout.as_secs_f64(),
                    "Handler timed out"
                );
                Err(HandlerError::new("handler timed out").into())
            }
        }
    }
}

/// Accumulates the request body, failing as soon as it grows past `limit`.
async fn receive_body(body: Body, limit: usize) -> Result<Bytes, DispatchError> {
    let mut stream = body.into_data_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DispatchError::BodyRead(e.to_string()))?;
        if buf.len() + chunk.len() > limit {
            debug!(limit, received = buf.len() + chunk.len(), "Request body too large");
            return Err(DispatchError::PayloadTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(Bytes::from(buf))
}

/// GET never carries a payload. An empty body means no payload.
fn parse_payload(method: &Method, bytes: &[u8]) -> Result<Option<Value>, DispatchError> {
    if *method == Method::GET || bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|e| DispatchError::MalformedJson(e.to_string()))
}

/// All `Cookie` headers joined into one, as HTTP/2 clients may split them.
pub(crate) fn cookie_header(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RouteDescriptor;
    use crate::schema::{Schema, SchemaNode};
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    const SECRET: &str = "dispatch-secret";

    fn dispatcher(routes: Vec<RouteDescriptor>, config: &Config) -> Dispatcher {
        let mut registry = RouteRegistry::new();
        registry.register(routes).unwrap();
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(IdentityValidator::new(SECRET).unwrap()),
            config,
        )
    }

    fn config() -> Config {
        Config::new("https://app.example.com", SECRET)
    }

    fn echo(method: Method, path: &str) -> RouteDescriptor {
        RouteDescriptor::new(method, path, |identity, payload| async move {
            Ok(json!({
                "user": identity.and_then(|i| i.id().map(str::to_string)),
                "payload": payload,
            }))
        })
    }

    fn session_cookie(uid: &str) -> HeaderValue {
        let token = encode(
            &Header::default(),
            &json!({ "uid": uid }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        HeaderValue::from_str(&format!("session={token}")).unwrap()
    }

    async fn run(
        d: &Dispatcher,
        method: Method,
        uri: &str,
        headers: HeaderMap,
        body: impl Into<Body>,
    ) -> Result<Value, DispatchError> {
        d.dispatch(method, uri.parse().unwrap(), &headers, body.into())
            .await
    }

    #[tokio::test]
    async fn get_ignores_body_and_query() {
        let d = dispatcher(vec![echo(Method::GET, "/items")], &config());
        let result = run(&d, Method::GET, "/items?page=2", HeaderMap::new(), "not json").await;
        assert_eq!(assert_ok!(result), json!({"user": null, "payload": null}));
    }

    #[tokio::test]
    async fn body_at_limit_is_accepted() {
        let d = dispatcher(vec![echo(Method::POST, "/big")], &config());
        let filler = "x".repeat(MAX_BODY_BYTES - r#"{"f":""}"#.len());
        let body = format!(r#"{{"f":"{filler}"}}"#);
        assert_eq!(body.len(), MAX_BODY_BYTES);

        assert_ok!(run(&d, Method::POST, "/big", HeaderMap::new(), body).await);
    }

    #[tokio::test]
    async fn oversized_body_wins_over_missing_route() {
        let d = dispatcher(vec![], &config());
        let body = "x".repeat(MAX_BODY_BYTES + 1);
        let err = assert_err!(run(&d, Method::POST, "/nowhere", HeaderMap::new(), body).await);
        assert!(matches!(err, DispatchError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let d = dispatcher(vec![echo(Method::GET, "/a")], &config());
        let err = assert_err!(run(&d, Method::POST, "/a", HeaderMap::new(), "{}").await);
        assert!(matches!(err, DispatchError::RouteNotFound { .. }));
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_before_auth() {
        let d = dispatcher(vec![echo(Method::POST, "/a").require_auth()], &config());
        let err = assert_err!(run(&d, Method::POST, "/a", HeaderMap::new(), "{oops").await);
        assert!(matches!(err, DispatchError::MalformedJson(_)));
    }

    #[tokio::test]
    async fn empty_body_means_no_payload() {
        let d = dispatcher(vec![echo(Method::DELETE, "/a")], &config());
        let result = run(&d, Method::DELETE, "/a", HeaderMap::new(), Body::empty()).await;
        assert_eq!(assert_ok!(result)["payload"], Value::Null);
    }

    #[tokio::test]
    async fn auth_required_without_cookie_is_rejected() {
        let d = dispatcher(vec![echo(Method::POST, "/me").require_auth()], &config());
        let err = assert_err!(run(&d, Method::POST, "/me", HeaderMap::new(), "{}").await);
        assert!(matches!(err, DispatchError::Auth(_)));
    }

    #[tokio::test]
    async fn auth_passes_identity_to_handler() {
        let d = dispatcher(vec![echo(Method::POST, "/me").require_auth()], &config());
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, session_cookie("user-9"));

        let result = assert_ok!(run(&d, Method::POST, "/me", headers, "{}").await);
        assert_eq!(result["user"], json!("user-9"));
    }

    #[tokio::test]
    async fn split_cookie_headers_are_joined() {
        let d = dispatcher(vec![echo(Method::GET, "/me").require_auth()], &config());
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(COOKIE, session_cookie("user-3"));

        let result = assert_ok!(run(&d, Method::GET, "/me", headers, Body::empty()).await);
        assert_eq!(result["user"], json!("user-3"));
    }

    #[tokio::test]
    async fn schema_without_payload_is_bad_request() {
        let schema = Schema::new().field("name", SchemaNode::string(1, None));
        let d = dispatcher(vec![echo(Method::GET, "/s").with_schema(schema)], &config());
        let err = assert_err!(run(&d, Method::GET, "/s", HeaderMap::new(), Body::empty()).await);
        assert!(matches!(err, DispatchError::MissingPayload));
    }

    #[tokio::test]
    async fn null_body_on_schema_route_is_missing_payload() {
        let schema = Schema::new().field("qty", SchemaNode::number(0.0, None));
        let d = dispatcher(vec![echo(Method::POST, "/s").with_schema(schema)], &config());
        let err = assert_err!(run(&d, Method::POST, "/s", HeaderMap::new(), "null").await);
        assert!(matches!(err, DispatchError::MissingPayload));
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn null_body_without_schema_reaches_handler() {
        let d = dispatcher(vec![echo(Method::POST, "/a")], &config());
        let result = assert_ok!(run(&d, Method::POST, "/a", HeaderMap::new(), "null").await);
        assert_eq!(result["payload"], Value::Null);
    }

    #[tokio::test]
    async fn schema_failure_is_validation_error() {
        let schema = Schema::new().field("qty", SchemaNode::number(1.0, None));
        let d = dispatcher(vec![echo(Method::POST, "/s").with_schema(schema)], &config());
        let err = assert_err!(run(&d, Method::POST, "/s", HeaderMap::new(), r#"{"qty":0}"#).await);
        match err {
            DispatchError::Validation(v) => assert_eq!(v.path, "qty"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_is_reported() {
        let failing = RouteDescriptor::new(Method::POST, "/fail", |_identity, _payload| async {
            Err(HandlerError::new("boom"))
        });
        let d = dispatcher(vec![failing], &config());
        let err = assert_err!(run(&d, Method::POST, "/fail", HeaderMap::new(), "{}").await);
        assert!(matches!(err, DispatchError::Handler(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let slow = RouteDescriptor::new(Method::GET, "/slow", |_identity, _payload| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        });
        let cfg = config().with_timeouts(Duration::from_secs(10), Duration::from_secs(1));
        let d = dispatcher(vec![slow], &cfg);

        let err = assert_err!(run(&d, Method::GET, "/slow", HeaderMap::new(), Body::empty()).await);
        assert!(matches!(err, DispatchError::Handler(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_times_out() {
        let d = dispatcher(vec![echo(Method::POST, "/a")], &config());
        let stalled = futures_util::stream::pending::<Result<Bytes, std::io::Error>>();

        let err = assert_err!(
            run(&d, Method::POST, "/a", HeaderMap::new(), Body::from_stream(stalled)).await
        );
        assert!(matches!(err, DispatchError::BodyTimeout));
    }
}
