//! Error types for hero-watch-core operations.
//!
//! Nothing in the resident process propagates these past a tick or a
//! lifecycle callback; call sites log them and degrade.

use std::path::PathBuf;

/// All errors that can occur in hero-watch-core operations.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid endpoint URL: {url}: {details}")]
    InvalidUrl { url: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Network Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP request timed out: {0}")]
    Timeout(String),

    #[error("HTTP status {status} from poll endpoint")]
    HttpStatus { status: u16 },

    // ─────────────────────────────────────────────────────────────────────
    // Platform Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Platform call failed: {operation}: {details}")]
    Platform { operation: String, details: String },

    #[error("Alert effect failed: {effect}: {details}")]
    Effect {
        effect: &'static str,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl WatchError {
    pub fn platform(operation: impl Into<String>, details: impl Into<String>) -> Self {
        WatchError::Platform {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn effect(effect: &'static str, details: impl Into<String>) -> Self {
        WatchError::Effect {
            effect,
            details: details.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WatchError::Io {
            context: context.into(),
            source,
        }
    }

    /// Transport-level failures the next scheduled tick retries implicitly.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WatchError::Http(_) | WatchError::Timeout(_) | WatchError::HttpStatus { .. }
        )
    }
}

/// Convenience type alias for Results using WatchError.
pub type Result<T> = std::result::Result<T, WatchError>;

impl From<WatchError> for String {
    fn from(err: WatchError) -> String {
        err.to_string()
    }
}
