//! Error types for tiercache
//!
//! All modules use `ProxyResult<T>` as their return type. Remote tier
//! failures carry their own `RemoteError` so callers can branch on
//! not-found and conflict outcomes without inspecting messages.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for tiercache operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Result type alias for remote cache operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures reported by the remote cache tier
#[derive(Error, Debug)]
pub enum RemoteError {
    /// No blob exists for the key yet. Absence, not a failure.
    #[error("cache entry not found: {key}")]
    NotFound { key: String },

    /// Another writer already created the key.
    #[error("cache entry already exists: {key}")]
    Conflict { key: String },

    #[error("{operation} failed with HTTP {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("{operation} transport error: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: ureq::Error,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected response from {operation}: {reason}")]
    Protocol {
        operation: &'static str,
        reason: String,
    },
}

impl RemoteError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    pub fn transport(operation: &'static str, source: ureq::Error) -> Self {
        Self::Transport { operation, source }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// HTTP status code attached to the failure, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(404),
            Self::Conflict { .. } => Some(409),
            _ => None,
        }
    }
}

/// All errors that can occur in tiercache
#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Missing required setting: {name}")]
    MissingConfig { name: &'static str },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Local store errors
    #[error("Local cache error at {path}: {reason}")]
    LocalStore { path: PathBuf, reason: String },

    // Remote tier errors
    #[error(transparent)]
    Remote(#[from] RemoteError),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Failure produced once and handed to every caller of a dedup group
    #[error(transparent)]
    Shared(Arc<ProxyError>),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a local store error
    pub fn local(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::LocalStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a joined blocking task failure
    pub fn join(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {}", err))
    }

    /// Remote error at the root of this error, looking through shared wrappers
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Shared(inner) => inner.remote(),
            _ => None,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::MissingConfig {
                name: "ACTIONS_RUNTIME_TOKEN",
            } => Some("Run inside a GitHub Actions job, or export ACTIONS_RUNTIME_TOKEN"),
            Self::MissingConfig {
                name: "ACTIONS_CACHE_URL",
            } => Some("Export ACTIONS_CACHE_URL, or ACTIONS_RESULTS_URL with ACTIONS_CACHE_SERVICE_V2=true"),
            Self::MissingConfig {
                name: "ACTIONS_RESULTS_URL",
            } => Some("Export ACTIONS_RESULTS_URL, or set remote.api = \"v1\" with ACTIONS_CACHE_URL"),
            Self::ConfigInvalid { .. } => Some("Run: tiercache config show"),
            _ => None,
        }
    }
}

impl From<Arc<ProxyError>> for ProxyError {
    fn from(err: Arc<ProxyError>) -> Self {
        Self::Shared(err)
    }
}
