//! Configuration module for the mailbox account and engine settings
//!
//! All configuration is loaded from environment variables. A single
//! `EMAIL_ADDRESS`/`EMAIL_APP_PASSWORD` pair (or the `EMAIL_USER`/`EMAIL_PASS`
//! synonyms) identifies the mailbox; everything else has a documented default.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// IMAP account configuration
///
/// Holds connection details and credentials for the single monitored mailbox.
/// The password is stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// IMAP server hostname (default `imap.gmail.com`)
    pub host: String,
    /// IMAP server port (default 993)
    pub port: u16,
    /// TLS is always on; kept as a field for parity with the connection code
    pub secure: bool,
    /// Mailbox address, used as the IMAP login user
    pub user: String,
    /// App password, stored in a type that prevents accidental logging
    pub pass: SecretString,
}

/// Engine-wide configuration
///
/// Wraps the account config and every tunable the sync pipeline, IMAP client,
/// listener registry, and LLM gateway need. Cloned into long-lived tasks via
/// `Arc` for thread-safe shared access.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The single monitored mailbox account
    pub account: AccountConfig,
    /// Path to the SQLite mail store database file
    pub db_path: PathBuf,
    /// Directory scanned (and watched) for listener rule files
    pub listeners_dir: PathBuf,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake/auth timeout in milliseconds
    pub auth_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds for ordinary commands
    pub socket_timeout_ms: u64,
    /// Interval between keepalive NOOPs while not idling
    pub keepalive_interval_ms: u64,
    /// Maximum duration to hold a single IDLE command before renewing it
    pub idle_renewal_ms: u64,
    /// Backoff delay after an IDLE/connection error before reconnecting
    pub idle_reconnect_backoff_ms: u64,
    /// API key for the LLM sub-agent gateway (`callAgent`)
    pub llm_api_key: Option<SecretString>,
    /// Default model alias used when a listener's `callAgent` omits one
    pub llm_default_model: String,
    /// Upper bound on wall time for a single `callAgent` call
    pub llm_call_timeout_ms: u64,
    /// TCP port the HTTP/WebSocket surface binds to
    pub http_port: u16,
}

impl EngineConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// EMAIL_ADDRESS=user@gmail.com
    /// EMAIL_APP_PASSWORD=app-specific-password
    /// IMAP_HOST=imap.gmail.com
    /// IMAP_PORT=993
    /// MAILFLOW_DB_PATH=./mailflow.db
    /// MAILFLOW_LISTENERS_DIR=./listeners.d
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let user = first_present_env(&["EMAIL_ADDRESS", "EMAIL_USER"])?;
        let pass = first_present_env(&["EMAIL_APP_PASSWORD", "EMAIL_PASS"])?;

        let account = AccountConfig {
            host: env_or_default("IMAP_HOST", "imap.gmail.com"),
            port: parse_u16_env("IMAP_PORT", 993)?,
            secure: true,
            user,
            pass: SecretString::new(pass.into()),
        };

        Ok(Self {
            account,
            db_path: PathBuf::from(env_or_default("MAILFLOW_DB_PATH", "./mailflow.db")),
            listeners_dir: PathBuf::from(env_or_default(
                "MAILFLOW_LISTENERS_DIR",
                "./listeners.d",
            )),
            connect_timeout_ms: parse_u64_env("MAILFLOW_CONNECT_TIMEOUT_MS", 30_000)?,
            auth_timeout_ms: parse_u64_env("MAILFLOW_AUTH_TIMEOUT_MS", 30_000)?,
            socket_timeout_ms: parse_u64_env("MAILFLOW_SOCKET_TIMEOUT_MS", 60_000)?,
            keepalive_interval_ms: parse_u64_env("MAILFLOW_KEEPALIVE_INTERVAL_MS", 10_000)?,
            idle_renewal_ms: parse_u64_env("MAILFLOW_IDLE_RENEWAL_MS", 5 * 60_000)?,
            idle_reconnect_backoff_ms: parse_u64_env("MAILFLOW_IDLE_BACKOFF_MS", 5_000)?,
            llm_api_key: env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| SecretString::new(v.into())),
            llm_default_model: env_or_default("MAILFLOW_LLM_DEFAULT_MODEL", "haiku"),
            llm_call_timeout_ms: parse_u64_env("MAILFLOW_LLM_TIMEOUT_MS", 30_000)?,
            http_port: parse_u16_env("MAILFLOW_HTTP_PORT", 8787)?,
        })
    }
}

/// Read the first environment variable present among `keys`, in order
///
/// Used to support documented synonyms (`EMAIL_ADDRESS`/`EMAIL_USER`).
fn first_present_env(keys: &[&str]) -> AppResult<String> {
    for key in keys {
        if let Ok(v) = env::var(key)
            && !v.trim().is_empty()
        {
            return Ok(v);
        }
    }
    Err(AppError::InvalidInput(format!(
        "missing required environment variable (one of {})",
        keys.join(", ")
    )))
}

/// Read an optional environment variable, falling back to `default`
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Parse a `u16` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u16`.
fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    match env::var(key) {
        Ok(v) => v.parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_u16_env;

    #[test]
    fn parse_u16_env_falls_back_to_default_when_unset() {
        // SAFETY: test runs single-threaded within this process and the key
        // is unique to this test.
        unsafe {
            std::env::remove_var("MAILFLOW_TEST_PORT_UNSET");
        }
        assert_eq!(parse_u16_env("MAILFLOW_TEST_PORT_UNSET", 993).unwrap(), 993);
    }

    #[test]
    fn parse_u16_env_rejects_invalid_values() {
        // SAFETY: see above.
        unsafe {
            std::env::set_var("MAILFLOW_TEST_PORT_BAD", "not-a-port");
        }
        assert!(parse_u16_env("MAILFLOW_TEST_PORT_BAD", 993).is_err());
        unsafe {
            std::env::remove_var("MAILFLOW_TEST_PORT_BAD");
        }
    }
}
