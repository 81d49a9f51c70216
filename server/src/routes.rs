//! Router wiring for the Gatehouse server.
//!
//! Only one path is routed by axum itself:
//!
//! - `GET /connections` - realtime WebSocket endpoint
//!
//! Everything else (including non-GET requests to `/connections`) falls
//! through to the [`Dispatcher`], so the route space is owned by the
//! [`RouteRegistry`] the binary fills at startup.
//!
//! # Example
//!
//! ```rust,no_run
//! use gatehouse_server::config::Config;
//! use gatehouse_server::gateway::Gateway;
//! use gatehouse_server::registry::RouteRegistry;
//! use gatehouse_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let gateway = Gateway::new([config.origin.clone()]);
//!     let state = AppState::new(config, RouteRegistry::new(), gateway).expect("valid config");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::rejection::WebSocketUpgradeRejection, State, WebSocketUpgrade,
    },
    http::{header::ORIGIN, HeaderMap, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::IdentityValidator;
use crate::config::{Config, ConfigError};
use crate::dispatch::{cookie_header, Dispatcher};
use crate::envelope::EnvelopeResponse;
use crate::error::HandlerError;
use crate::gateway::{run_connection, Gateway, REALTIME_PATH};
use crate::registry::{RouteDescriptor, RouteRegistry};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// HTTP pipeline over the registered routes.
    pub dispatcher: Dispatcher,

    /// Session token verifier shared by both engines.
    pub validator: Arc<IdentityValidator>,

    /// Realtime rooms and connection records.
    pub gateway: Gateway,

    /// Server start time for uptime calculation.
    pub start_time: Instant,

    origin: HeaderValue,
}

impl AppState {
    /// Builds the state from a finished registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the token secret is empty or the origin
    /// is not a valid header value.
    pub fn new(
        config: Config,
        registry: RouteRegistry,
        gateway: Gateway,
    ) -> Result<Self, ConfigError> {
        let origin = HeaderValue::from_str(&config.origin)
            .map_err(|_| ConfigError::invalid("GATEHOUSE_ORIGIN", "not a valid header value"))?;
        let validator = Arc::new(IdentityValidator::new(&config.token_secret)?);
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::clone(&validator), &config);

        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            validator,
            gateway,
            start_time: Instant::now(),
            origin,
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("routes", &self.dispatcher.registry().len())
            .field("gateway", &self.gateway)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            REALTIME_PATH,
            get(get_connections).fallback(dispatch_request),
        )
        .fallback(dispatch_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON body of a refused handshake.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Runs a request through the dispatcher and wraps the outcome.
async fn dispatch_request(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> EnvelopeResponse {
    match state.dispatcher.dispatch(method, uri, &headers, body).await {
        Ok(result) => EnvelopeResponse::success(result, &state.origin),
        Err(err) => EnvelopeResponse::failure(&err, &state.origin),
    }
}

/// Realtime handshake. Origin and session are checked before the upgrade
/// is accepted; a refused handshake never reaches the gateway.
async fn get_connections(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    let cookies = cookie_header(&headers);

    let identity = match state.gateway.handshake(
        origin,
        cookies.as_deref(),
        &state.validator,
        &state.config.cookie_name,
    ) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(origin = origin.unwrap_or("<none>"), reason = %err, "Realtime handshake refused");
            return (
                err.status(),
                Json(ErrorResponse {
                    error: err.client_message().to_string(),
                }),
            )
                .into_response();
        }
    };

    match ws {
        Ok(ws) => {
            let gateway = state.gateway.clone();
            ws.on_upgrade(move |socket| run_connection(socket, gateway, identity))
        }
        Err(rejection) => rejection.into_response(),
    }
}

// ============================================================================
// Health
// ============================================================================

/// Health check response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub uptime_seconds: u64,
}

/// `GET /health`, registered through the route registry like any other
/// route. Reports uptime since `start_time` and live realtime connections.
#[must_use]
pub fn health_route(gateway: Gateway, start_time: Instant) -> RouteDescriptor {
    RouteDescriptor::new(Method::GET, "/health", move |_identity, _payload| {
        let gateway = gateway.clone();
        async move {
            let health = HealthResponse {
                status: "ok".to_string(),
                connections: gateway.connection_count(),
                uptime_seconds: start_time.elapsed().as_secs(),
            };
            serde_json::to_value(health).map_err(|e| HandlerError::new(e.to_string()))
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
