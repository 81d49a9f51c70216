//! Route descriptors and the lookup table the HTTP dispatcher reads.
//!
//! Routes are registered once, before the server starts listening, and the
//! registry is read-only afterwards. Each route is keyed by `METHOD:path`.
//! Registering the same key twice is an error; nothing from the failing
//! batch is applied.
//!
//! # Example
//!
//! ```rust
//! use axum::http::Method;
//! use gatehouse_server::registry::{RouteDescriptor, RouteRegistry};
//! use gatehouse_server::schema::{Schema, SchemaNode};
//! use serde_json::json;
//!
//! let mut registry = RouteRegistry::new();
//! registry
//!     .register(vec![RouteDescriptor::new(Method::POST, "/login", |_identity, payload| async move {
//!         Ok(json!({ "welcome": payload }))
//!     })
//!     .with_schema(Schema::new().field("user", SchemaNode::string(1, None)))])
//!     .expect("no duplicates");
//!
//! assert!(registry.lookup(&Method::POST, "/login").is_some());
//! assert!(registry.lookup(&Method::GET, "/login").is_none());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::http::Method;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::auth::Identity;
use crate::error::HandlerError;
use crate::schema::Schema;

/// Result of a route handler: the value placed in the envelope's `response`.
pub type HandlerResult = Result<Value, HandlerError>;

/// Type-erased asynchronous route handler.
///
/// Receives the caller's identity (present only on authenticated routes) and
/// the parsed JSON payload (absent for GET and for empty bodies).
pub type RouteHandler =
    Arc<dyn Fn(Option<Identity>, Option<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Errors raised while building the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A route with the same method and path is already registered.
    #[error("route already registered: {0}")]
    Duplicate(String),
}

/// Everything the dispatcher needs to serve one `(method, path)`.
#[derive(Clone)]
pub struct RouteDescriptor {
    pub method: Method,
    pub path: String,
    pub require_auth: bool,
    pub schema: Option<Schema>,
    pub handler: RouteHandler,
}

impl RouteDescriptor {
    /// Creates a public route with no schema.
    pub fn new<F, Fut>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Identity>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            method,
            path: path.into(),
            require_auth: false,
            schema: None,
            handler: Arc::new(move |identity, payload| handler(identity, payload).boxed()),
        }
    }

    /// Requires a valid session cookie (builder pattern).
    #[must_use]
    pub fn require_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    /// Declares the payload schema (builder pattern).
    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// The registry key for this route.
    #[must_use]
    pub fn key(&self) -> String {
        route_key(&self.method, &self.path)
    }
}

impl fmt::Debug for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("require_auth", &self.require_auth)
            .field("schema_fields", &self.schema.as_ref().map(Schema::len))
            .finish_non_exhaustive()
    }
}

fn route_key(method: &Method, path: &str) -> String {
    format!("{}:{}", method.as_str(), path)
}

/// Lookup table from `METHOD:path` to route descriptor.
#[derive(Debug, Default, Clone)]
pub struct RouteRegistry {
    routes: HashMap<String, Arc<RouteDescriptor>>,
}

impl RouteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a batch of routes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if any route collides with an
    /// existing one or with another route in the same batch. In that case
    /// the registry is left unchanged.
    pub fn register(
        &mut self,
        routes: impl IntoIterator<Item = RouteDescriptor>,
    ) -> Result<(), RegistryError> {
        let mut staged: HashMap<String, Arc<RouteDescriptor>> = HashMap::new();

        for route in routes {
            let key = route.key();
            if self.routes.contains_key(&key) || staged.contains_key(&key) {
                return Err(RegistryError::Duplicate(key));
            }
            staged.insert(key, Arc::new(route));
        }

        for (key, route) in staged {
            debug!(
                route = %key,
                require_auth = route.require_auth,
                has_schema = route.schema.is_some(),
                "Route registered"
            );
            self.routes.insert(key, route);
        }

        Ok(())
    }

    /// Finds the route for a method and path. The path must not carry a
    /// query string.
    #[must_use]
    pub fn lookup(&self, method: &Method, path: &str) -> Option<Arc<RouteDescriptor>> {
        self.routes.get(&route_key(method, path)).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
