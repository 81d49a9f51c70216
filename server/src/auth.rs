//! Session token verification for both dispatch engines.
//!
//! Callers authenticate with a session cookie whose value is a JWT signed with
//! the server's shared secret (HS256). The HTTP dispatcher and the realtime
//! handshake both go through [`IdentityValidator::authenticate`], which pulls
//! the token out of the `Cookie` header and verifies it.
//!
//! Token issuance happens elsewhere; this module only verifies.
//!
//! # Example
//!
//! ```rust
//! use gatehouse_server::auth::{extract_token, IdentityValidator, AuthError};
//!
//! let validator = IdentityValidator::new("secret").expect("secret is set");
//!
//! assert_eq!(extract_token("theme=dark; session=abc.def.ghi", "session"), Some("abc.def.ghi"));
//! assert!(matches!(
//!     validator.authenticate(None, "session"),
//!     Err(AuthError::MissingCookie)
//! ));
//! ```

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::ConfigError;

/// Errors that can occur while authenticating a caller.
///
/// All of these surface as 403 over HTTP and as a refused handshake on the
/// realtime endpoint. The variants exist for logging only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No cookie header, or no cookie with the configured name.
    #[error("session cookie is missing")]
    MissingCookie,

    /// The token is not a well-formed JWT or its claims are not an object.
    #[error("malformed session token")]
    MalformedToken,

    /// The token signature does not match the server secret.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The token's `exp` claim is in the past.
    #[error("session token expired")]
    Expired,
}

/// Verified claims extracted from a session token.
///
/// The claim set is opaque to the gateway; handlers interpret it.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    claims: Map<String, Value>,
}

impl Identity {
    /// Wraps an already-verified claim set.
    #[must_use]
    pub fn from_claims(claims: Map<String, Value>) -> Self {
        Self { claims }
    }

    /// Returns the caller's identifier: the `uid` claim, else `sub`.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.claims
            .get("uid")
            .or_else(|| self.claims.get("sub"))
            .and_then(Value::as_str)
    }

    /// Returns a single claim by name.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// Returns the full claim set.
    #[must_use]
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }
}

/// Extracts the session token from a `Cookie` header value.
///
/// Pairs are separated by `;`. The first pair whose name equals
/// `cookie_name` wins; its value is everything after the first `=`.
/// An empty value is treated as absent.
#[must_use]
pub fn extract_token<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| name.trim() == cookie_name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Verifies session tokens against the configured signing secret.
#[derive(Clone)]
pub struct IdentityValidator {
    key: DecodingKey,
    validation: Validation,
}

impl IdentityValidator {
    /// Creates a validator for the given signing secret.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the secret is empty. This is a startup
    /// failure, never a per-request one.
    pub fn new(secret: &str) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::missing("GATEHOUSE_TOKEN_SECRET"));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens without `exp` are accepted; `exp` is enforced when present.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Verifies a raw token and returns the decoded identity.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidSignature`] for a bad signature,
    /// [`AuthError::Expired`] for a past `exp`, and
    /// [`AuthError::MalformedToken`] for anything else.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Value>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::MalformedToken,
            }
        })?;

        match data.claims {
            Value::Object(claims) => Ok(Identity::from_claims(claims)),
            _ => Err(AuthError::MalformedToken),
        }
    }

    /// Extracts and verifies the session token from a `Cookie` header.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCookie`] when the header or the named
    /// cookie is absent, otherwise whatever [`verify`](Self::verify) returns.
    pub fn authenticate(
        &self,
        cookie_header: Option<&str>,
        cookie_name: &str,
    ) -> Result<Identity, AuthError> {
        let token = cookie_header
            .and_then(|header| extract_token(header, cookie_name))
            .ok_or(AuthError::MissingCookie)?;
        self.verify(token)
    }
}

impl std::fmt::Debug for IdentityValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityValidator")
            .field("algorithm", &"HS256")
            .finish_non_exhaustive()
    }
}
