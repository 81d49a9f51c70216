//! Server configuration module.
//!
//! Parses configuration from environment variables for the Gatehouse server.
//! The resulting [`Config`] is immutable and shared by both dispatch engines.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GATEHOUSE_ORIGIN` | Yes | - | Allowed CORS and handshake origin |
//! | `GATEHOUSE_TOKEN_SECRET` | Yes | - | HMAC secret used to verify session tokens |
//! | `GATEHOUSE_COOKIE_NAME` | No | `session` | Name of the session cookie |
//! | `GATEHOUSE_DEBUG` | No | false | Verbose request logging |
//! | `GATEHOUSE_BODY_TIMEOUT_SECS` | No | 10 | Max seconds to receive a request body |
//! | `GATEHOUSE_HANDLER_TIMEOUT_SECS` | No | 30 | Max seconds for a route handler |
//! | `PORT` | No | 8080 | HTTP server port |
//!
//! A `.env` file in the working directory or any of its parents is loaded
//! first by [`load_env_file`]; variables already set in the process win.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

pub use crate::error::ConfigError;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default session cookie name.
const DEFAULT_COOKIE_NAME: &str = "session";

/// Default time allowed for a request body to arrive.
const DEFAULT_BODY_TIMEOUT_SECS: u64 = 10;

/// Default time allowed for a route handler to finish.
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 30;

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// The single origin allowed by CORS and the realtime handshake.
    pub origin: String,

    /// Name of the cookie carrying the session token.
    pub cookie_name: String,

    /// Secret used to verify session token signatures.
    pub token_secret: String,

    /// When true, request-level activity is logged at debug level.
    pub debug: bool,

    /// HTTP server port.
    pub port: u16,

    /// Upper bound on the time spent receiving a request body.
    pub body_timeout: Duration,

    /// Upper bound on the time spent inside a route handler.
    pub handler_timeout: Duration,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `GATEHOUSE_ORIGIN` or `GATEHOUSE_TOKEN_SECRET` is missing or empty
    /// - A numeric variable does not parse
    ///
    /// # Example
    ///
    /// ```no_run
    /// use gatehouse_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let origin = required_env("GATEHOUSE_ORIGIN")?;
        let token_secret = required_env("GATEHOUSE_TOKEN_SECRET")?;
        let cookie_name = match env::var("GATEHOUSE_COOKIE_NAME") {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => DEFAULT_COOKIE_NAME.to_string(),
        };

        let config = Self {
            origin,
            cookie_name,
            token_secret,
            debug: parse_bool_env("GATEHOUSE_DEBUG"),
            port: parse_port()?,
            body_timeout: parse_secs_env("GATEHOUSE_BODY_TIMEOUT_SECS", DEFAULT_BODY_TIMEOUT_SECS)?,
            handler_timeout: parse_secs_env(
                "GATEHOUSE_HANDLER_TIMEOUT_SECS",
                DEFAULT_HANDLER_TIMEOUT_SECS,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration with defaults for everything but the origin
    /// and secret.
    #[must_use]
    pub fn new(origin: impl Into<String>, token_secret: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            token_secret: token_secret.into(),
            debug: false,
            port: DEFAULT_PORT,
            body_timeout: Duration::from_secs(DEFAULT_BODY_TIMEOUT_SECS),
            handler_timeout: Duration::from_secs(DEFAULT_HANDLER_TIMEOUT_SECS),
        }
    }

    /// Sets the session cookie name (builder pattern).
    #[must_use]
    pub fn with_cookie_name(mut self, cookie_name: impl Into<String>) -> Self {
        self.cookie_name = cookie_name.into();
        self
    }

    /// Sets both request timeouts (builder pattern).
    #[must_use]
    pub fn with_timeouts(mut self, body_timeout: Duration, handler_timeout: Duration) -> Self {
        self.body_timeout = body_timeout;
        self.handler_timeout = handler_timeout;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.body_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "GATEHOUSE_BODY_TIMEOUT_SECS",
                "must be greater than zero",
            ));
        }
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "GATEHOUSE_HANDLER_TIMEOUT_SECS",
                "must be greater than zero",
            ));
        }
        if self.cookie_name.contains(['=', ';']) {
            return Err(ConfigError::invalid(
                "GATEHOUSE_COOKIE_NAME",
                "must not contain '=' or ';'",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("origin", &self.origin)
            .field("cookie_name", &self.cookie_name)
            .field("token_secret", &"<redacted>")
            .field("debug", &self.debug)
            .field("port", &self.port)
            .field("body_timeout", &self.body_timeout)
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

/// Loads a `.env` file from the working directory or the nearest parent
/// that has one.
///
/// Returns the path that was loaded, or `None` when no file was found.
/// A file that exists but cannot be parsed is reported and skipped.
pub fn load_env_file() -> Option<PathBuf> {
    match dotenvy::dotenv() {
        Ok(path) => {
            debug!(path = %path.display(), "Loaded .env file");
            Some(path)
        }
        Err(err) if err.not_found() => None,
        Err(err) => {
            warn!(error = %err, "Failed to load .env file");
            None
        }
    }
}

/// Reads a required, non-empty environment variable.
fn required_env(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::missing(name)),
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" or "1" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => port_str
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPort(port_str)),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::invalid(
            "PORT",
            "contains invalid unicode",
        )),
    }
}

/// Parse a whole-seconds duration, falling back to `default` when unset.
fn parse_secs_env(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::invalid(name, format!("expected whole seconds, got '{value}'"))),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to temporarily set environment variables for testing.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    fn clear_all(guard: &mut EnvGuard) {
        for key in [
            "GATEHOUSE_ORIGIN",
            "GATEHOUSE_TOKEN_SECRET",
            "GATEHOUSE_COOKIE_NAME",
            "GATEHOUSE_DEBUG",
            "GATEHOUSE_BODY_TIMEOUT_SECS",
            "GATEHOUSE_HANDLER_TIMEOUT_SECS",
            "PORT",
        ] {
            guard.remove(key);
        }
    }

    #[test]
    #[serial]
    fn test_config_with_required_vars_uses_defaults() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("GATEHOUSE_ORIGIN", "https://app.example.com");
        guard.set("GATEHOUSE_TOKEN_SECRET", "s3cret");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.origin, "https://app.example.com");
        assert_eq!(config.token_secret, "s3cret");
        assert_eq!(config.cookie_name, DEFAULT_COOKIE_NAME);
        assert!(!config.debug);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.body_timeout, Duration::from_secs(10));
        assert_eq!(config.handler_timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_config_with_all_vars() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("GATEHOUSE_ORIGIN", "https://app.example.com");
        guard.set("GATEHOUSE_TOKEN_SECRET", "s3cret");
        guard.set("GATEHOUSE_COOKIE_NAME", "sid");
        guard.set("GATEHOUSE_DEBUG", "TRUE");
        guard.set("GATEHOUSE_BODY_TIMEOUT_SECS", "3");
        guard.set("GATEHOUSE_HANDLER_TIMEOUT_SECS", "7");
        guard.set("PORT", "9090");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.cookie_name, "sid");
        assert!(config.debug);
        assert_eq!(config.port, 9090);
        assert_eq!(config.body_timeout, Duration::from_secs(3));
        assert_eq!(config.handler_timeout, Duration::from_secs(7));
    }

    #[test]
    #[serial]
    fn test_config_missing_origin() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("GATEHOUSE_TOKEN_SECRET", "s3cret");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "GATEHOUSE_ORIGIN"));
    }

    #[test]
    #[serial]
    fn test_config_missing_secret() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("GATEHOUSE_ORIGIN", "https://app.example.com");

        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingEnvVar(ref v) if v == "GATEHOUSE_TOKEN_SECRET")
        );
    }

    #[test]
    #[serial]
    fn test_config_blank_secret_counts_as_missing() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("GATEHOUSE_ORIGIN", "https://app.example.com");
        guard.set("GATEHOUSE_TOKEN_SECRET", "   ");

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::MissingEnvVar(_)
        ));
    }

    #[test]
    #[serial]
    fn test_config_rejects_zero_timeout() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("GATEHOUSE_ORIGIN", "https://app.example.com");
        guard.set("GATEHOUSE_TOKEN_SECRET", "s3cret");
        guard.set("GATEHOUSE_HANDLER_TIMEOUT_SECS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == "GATEHOUSE_HANDLER_TIMEOUT_SECS")
        );
    }

    #[test]
    #[serial]
    fn test_config_rejects_cookie_name_with_separator() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("GATEHOUSE_ORIGIN", "https://app.example.com");
        guard.set("GATEHOUSE_TOKEN_SECRET", "s3cret");
        guard.set("GATEHOUSE_COOKIE_NAME", "a=b");

        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_parse_bool_env() {
        let mut guard = EnvGuard::new();
        guard.set("TEST_BOOL", "true");
        assert!(parse_bool_env("TEST_BOOL"));

        guard.set("TEST_BOOL", "1");
        assert!(parse_bool_env("TEST_BOOL"));

        guard.set("TEST_BOOL", "no");
        assert!(!parse_bool_env("TEST_BOOL"));

        guard.remove("TEST_BOOL");
        assert!(!parse_bool_env("TEST_BOOL"));
    }

    #[test]
    #[serial]
    fn test_parse_port_invalid() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "not-a-number");
        assert!(matches!(parse_port().unwrap_err(), ConfigError::InvalidPort(_)));

        guard.set("PORT", "99999");
        assert!(parse_port().is_err());
    }

    #[test]
    #[serial]
    fn test_parse_secs_env_invalid() {
        let mut guard = EnvGuard::new();
        guard.set("TEST_SECS", "soon");
        assert!(parse_secs_env("TEST_SECS", 5).is_err());

        guard.remove("TEST_SECS");
        assert_eq!(parse_secs_env("TEST_SECS", 5).unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = Config::new("https://app.example.com", "super-secret-value");
        let debug_str = format!("{config:?}");
        assert!(debug_str.contains("<redacted>"));
        assert!(!debug_str.contains("super-secret-value"));
    }

    #[test]
    fn test_builders() {
        let config = Config::new("https://a", "s")
            .with_cookie_name("sid")
            .with_timeouts(Duration::from_millis(50), Duration::from_millis(60));
        assert_eq!(config.cookie_name, "sid");
        assert_eq!(config.body_timeout, Duration::from_millis(50));
        assert_eq!(config.handler_timeout, Duration::from_millis(60));
    }
}
