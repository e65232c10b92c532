//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to an HTTP status code for the `/api/*` surface
//! consumed by the UI collaborator.

use axum::http::StatusCode;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers every case the sync pipeline, store, and dispatcher may encounter.
/// Each variant maps to an HTTP status for the outward-facing API.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (message, listener, folder)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response, LLM call)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Conflict (concurrent writer collision, UID no longer valid)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Local store error (constraint violation, I/O, corrupt row)
    #[error("store error: {0}")]
    Store(String),
    /// A listener handler failed; always isolated, never propagated to the caller
    #[error("listener '{listener_id}' failed: {source}")]
    Listener {
        listener_id: String,
        #[source]
        source: Box<AppError>,
    },
    /// `callAgent` response did not contain a structured block matching the schema
    #[error("validation error: {0}")]
    Validation(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Wrap an error as having originated from a specific listener
    pub fn from_listener(listener_id: impl Into<String>, source: AppError) -> Self {
        Self::Listener {
            listener_id: listener_id.into(),
            source: Box::new(source),
        }
    }

    /// Map to an HTTP status code for the `/api/*` surface
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` / `Validation` → 400
    /// - `NotFound` → 404
    /// - `AuthFailed` → 401, `Conflict` → 409
    /// - everything else → 500
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Timeout(_) | Self::Store(_) | Self::Listener { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable `{error, details?}` JSON body for the HTTP layer
    pub fn to_body(&self) -> serde_json::Value {
        json!({ "error": self.to_string(), "details": null })
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
