//! Call Controller configuration.
//!
//! Configuration is loaded from environment variables. The token-signing
//! secret and the Redis URL are redacted in Debug output.

use crate::auth::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use call_core::CallConfig;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default sweeper interval in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// Default revision poll interval for the Redis backend, in milliseconds.
pub const DEFAULT_STORE_POLL_INTERVAL_MS: u64 = 250;

/// Default graceful shutdown drain period in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 30;

/// Minimum length of the HS256 signing secret.
pub const MIN_AUTH_SECRET_BYTES: usize = 32;

/// Which document store backend to run against.
#[derive(Clone, Debug)]
pub enum StoreBackend {
    /// In-process store. Only useful for a single controller with
    /// clients in the same process (tests, local development).
    Memory,
    Redis {
        url: SecretString,
    },
}

impl StoreBackend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Redis { .. } => "redis",
        }
    }
}

/// Call Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    pub store_backend: StoreBackend,

    /// Shared HS256 secret used to verify bearer tokens.
    pub auth_secret: SecretString,

    /// JWT clock skew tolerance in seconds for `iat` validation.
    pub jwt_clock_skew_seconds: i64,

    pub sweep_interval_seconds: u64,

    /// How often the Redis backend polls revisions while waiting for a change.
    pub store_poll_interval_ms: u64,

    /// Seconds to keep serving after a shutdown signal. Zero skips the drain.
    pub drain_seconds: u64,

    /// Emit logs as JSON lines.
    pub log_json: bool,

    /// Tunables handed to the matcher, room controller and sweeper.
    pub call: CallConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("store_backend", &self.store_backend.as_str())
            .field("auth_secret", &"[REDACTED]")
            .field("jwt_clock_skew_seconds", &self.jwt_clock_skew_seconds)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("store_poll_interval_ms", &self.store_poll_interval_ms)
            .field("drain_seconds", &self.drain_seconds)
            .field("log_json", &self.log_json)
            .field("call", &self.call)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("CC_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let store_backend = match vars.get("CC_STORE_BACKEND").map(String::as_str) {
            None | Some("memory") => StoreBackend::Memory,
            Some("redis") => {
                let url = vars
                    .get("REDIS_URL")
                    .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;
                StoreBackend::Redis {
                    url: SecretString::from(url.clone()),
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "CC_STORE_BACKEND must be 'memory' or 'redis', got '{other}'"
                )));
            }
        };

        let auth_secret = vars
            .get("CC_AUTH_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("CC_AUTH_SECRET".to_string()))?;
        if auth_secret.len() < MIN_AUTH_SECRET_BYTES {
            // The value itself is never echoed.
            return Err(ConfigError::InvalidValue(format!(
                "CC_AUTH_SECRET must be at least {MIN_AUTH_SECRET_BYTES} bytes"
            )));
        }
        let auth_secret = SecretString::from(auth_secret.clone());

        let jwt_clock_skew_seconds = parse_clock_skew(vars)?;

        let defaults = CallConfig::default();
        let call = CallConfig {
            waiting_stale_after: Duration::from_secs(parse_positive(
                vars,
                "CC_WAITING_STALE_SECONDS",
                defaults.waiting_stale_after.as_secs(),
            )?),
            ended_retention: Duration::from_secs(parse_positive(
                vars,
                "CC_ENDED_RETENTION_SECONDS",
                defaults.ended_retention.as_secs(),
            )?),
            sweep_batch_size: parse_positive(vars, "CC_SWEEP_BATCH_SIZE", defaults.sweep_batch_size)?,
            pairing_page_size: parse_positive(
                vars,
                "CC_PAIRING_PAGE_SIZE",
                defaults.pairing_page_size,
            )?,
            base_duration_secs: parse_positive(
                vars,
                "CC_BASE_DURATION_SECONDS",
                defaults.base_duration_secs,
            )?,
            extension_secs: parse_positive(vars, "CC_EXTENSION_SECONDS", defaults.extension_secs)?,
            ..defaults
        };

        let sweep_interval_seconds = parse_positive(
            vars,
            "CC_SWEEP_INTERVAL_SECONDS",
            DEFAULT_SWEEP_INTERVAL_SECONDS,
        )?;
        let store_poll_interval_ms = parse_positive(
            vars,
            "CC_STORE_POLL_INTERVAL_MS",
            DEFAULT_STORE_POLL_INTERVAL_MS,
        )?;
        let drain_seconds = parse_number(vars, "CC_DRAIN_SECONDS", DEFAULT_DRAIN_SECONDS)?;
        let log_json = log_json(vars)?;

        Ok(Config {
            bind_address,
            store_backend,
            auth_secret,
            jwt_clock_skew_seconds,
            sweep_interval_seconds,
            store_poll_interval_ms,
            drain_seconds,
            log_json,
            call,
        })
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    #[must_use]
    pub fn store_poll_interval(&self) -> Duration {
        Duration::from_millis(self.store_poll_interval_ms)
    }
}

/// Read `CC_LOG_JSON`. Needed before the rest of the configuration so that
/// configuration errors are logged in the requested format.
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` for anything other than a boolean.
pub fn log_json(vars: &HashMap<String, String>) -> Result<bool, ConfigError> {
    match vars.get("CC_LOG_JSON").map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v == "1" || v == "true" => Ok(true),
        Some(v) if v == "0" || v == "false" || v.is_empty() => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue(format!(
            "CC_LOG_JSON must be true or false, got '{v}'"
        ))),
    }
}

fn parse_clock_skew(vars: &HashMap<String, String>) -> Result<i64, ConfigError> {
    let max = i64::try_from(MAX_CLOCK_SKEW.as_secs()).unwrap_or(i64::MAX);
    let Some(value_str) = vars.get("JWT_CLOCK_SKEW_SECONDS") else {
        return Ok(i64::try_from(DEFAULT_CLOCK_SKEW.as_secs()).unwrap_or(max));
    };

    let value: i64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "JWT_CLOCK_SKEW_SECONDS must be a valid integer, got '{value_str}': {e}"
        ))
    })?;
    if value <= 0 {
        return Err(ConfigError::InvalidValue(format!(
            "JWT_CLOCK_SKEW_SECONDS must be positive, got {value}"
        )));
    }
    if value > max {
        return Err(ConfigError::InvalidValue(format!(
            "JWT_CLOCK_SKEW_SECONDS must not exceed {max} seconds, got {value}"
        )));
    }
    Ok(value)
}

fn parse_number<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(value_str) => value_str.parse().map_err(|e| {
            ConfigError::InvalidValue(format!(
                "{name} must be a valid positive integer, got '{value_str}': {e}"
            ))
        }),
    }
}

fn parse_positive<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: fmt::Display,
{
    let value = parse_number(vars, name, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([("CC_AUTH_SECRET".to_string(), SECRET.to_string())])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert!(matches!(config.store_backend, StoreBackend::Memory));
        assert_eq!(config.auth_secret.expose_secret(), SECRET);
        assert_eq!(config.jwt_clock_skew_seconds, 300);
        assert_eq!(config.sweep_interval_seconds, DEFAULT_SWEEP_INTERVAL_SECONDS);
        assert_eq!(config.store_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.drain_seconds, DEFAULT_DRAIN_SECONDS);
        assert!(!config.log_json);
        assert_eq!(config.call, CallConfig::default());
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        for (key, value) in [
            ("CC_BIND_ADDRESS", "127.0.0.1:9000"),
            ("CC_STORE_BACKEND", "redis"),
            ("REDIS_URL", "redis://:pw@cache:6379"),
            ("JWT_CLOCK_SKEW_SECONDS", "120"),
            ("CC_WAITING_STALE_SECONDS", "60"),
            ("CC_ENDED_RETENTION_SECONDS", "7200"),
            ("CC_SWEEP_INTERVAL_SECONDS", "30"),
            ("CC_SWEEP_BATCH_SIZE", "50"),
            ("CC_PAIRING_PAGE_SIZE", "25"),
            ("CC_BASE_DURATION_SECONDS", "300"),
            ("CC_EXTENSION_SECONDS", "120"),
            ("CC_STORE_POLL_INTERVAL_MS", "100"),
            ("CC_DRAIN_SECONDS", "0"),
            ("CC_LOG_JSON", "true"),
        ] {
            vars.insert(key.to_string(), value.to_string());
        }

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        let StoreBackend::Redis { url } = &config.store_backend else {
            unreachable!("expected the redis backend");
        };
        assert_eq!(url.expose_secret(), "redis://:pw@cache:6379");
        assert_eq!(config.jwt_clock_skew_seconds, 120);
        assert_eq!(config.call.waiting_stale_after, Duration::from_secs(60));
        assert_eq!(config.call.ended_retention, Duration::from_secs(7200));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.call.sweep_batch_size, 50);
        assert_eq!(config.call.pairing_page_size, 25);
        assert_eq!(config.call.base_duration_secs, 300);
        assert_eq!(config.call.extension_secs, 120);
        assert_eq!(config.store_poll_interval_ms, 100);
        assert_eq!(config.drain_seconds, 0);
        assert!(config.log_json);
    }

    #[test]
    fn test_from_vars_missing_auth_secret() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "CC_AUTH_SECRET"));
    }

    #[test]
    fn test_short_auth_secret_rejected_without_echo() {
        let mut vars = base_vars();
        vars.insert("CC_AUTH_SECRET".to_string(), "hunter2".to_string());

        let err = Config::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let mut vars = base_vars();
        vars.insert("CC_STORE_BACKEND".to_string(), "redis".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "REDIS_URL"));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut vars = base_vars();
        vars.insert("CC_STORE_BACKEND".to_string(), "postgres".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("'postgres'"))
        );
    }

    #[test]
    fn test_jwt_clock_skew_bounds() {
        for (value, expected) in [
            ("0", "must be positive"),
            ("-100", "must be positive"),
            ("601", "must not exceed 600"),
            ("five-minutes", "must be a valid integer"),
        ] {
            let mut vars = base_vars();
            vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), value.to_string());
            let result = Config::from_vars(&vars);
            assert!(
                matches!(&result, Err(ConfigError::InvalidValue(msg)) if msg.contains(expected)),
                "{value}: {result:?}"
            );
        }

        let mut vars = base_vars();
        vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), "600".to_string());
        assert_eq!(Config::from_vars(&vars).unwrap().jwt_clock_skew_seconds, 600);
    }

    #[test]
    fn test_zero_tunables_rejected() {
        for name in [
            "CC_WAITING_STALE_SECONDS",
            "CC_ENDED_RETENTION_SECONDS",
            "CC_SWEEP_INTERVAL_SECONDS",
            "CC_SWEEP_BATCH_SIZE",
            "CC_PAIRING_PAGE_SIZE",
            "CC_BASE_DURATION_SECONDS",
        ] {
            let mut vars = base_vars();
            vars.insert(name.to_string(), "0".to_string());
            let result = Config::from_vars(&vars);
            assert!(
                matches!(&result, Err(ConfigError::InvalidValue(msg)) if msg.contains("greater than 0")),
                "{name}: {result:?}"
            );
        }
    }

    #[test]
    fn test_non_numeric_tunable_rejected() {
        let mut vars = base_vars();
        vars.insert("CC_SWEEP_BATCH_SIZE".to_string(), "lots".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("must be a valid positive integer"))
        );
    }

    #[test]
    fn test_log_json_values() {
        let with = |value: &str| HashMap::from([("CC_LOG_JSON".to_string(), value.to_string())]);

        assert!(log_json(&with("TRUE")).unwrap());
        assert!(log_json(&with("1")).unwrap());
        assert!(!log_json(&with("false")).unwrap());
        assert!(!log_json(&HashMap::new()).unwrap());
        assert!(log_json(&with("yes please")).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut vars = base_vars();
        vars.insert("CC_STORE_BACKEND".to_string(), "redis".to_string());
        vars.insert("REDIS_URL".to_string(), "redis://:hunter2@cache:6379".to_string());
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("redis"));
        assert!(!debug_output.contains(SECRET));
        assert!(!debug_output.contains("hunter2"));
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("CC_AUTH_SECRET", SECRET);
        std::env::set_var("CC_SWEEP_INTERVAL_SECONDS", "45");

        let config = Config::from_env();

        std::env::remove_var("CC_AUTH_SECRET");
        std::env::remove_var("CC_SWEEP_INTERVAL_SECONDS");

        let config = config.expect("Config should load from the environment");
        assert_eq!(config.sweep_interval_seconds, 45);
    }
}
