//! Centralized error types for the CareLink foundation layer.
//!
//! Uses `thiserror` for ergonomic error definitions. Chat-level failures
//! (REST, WebSocket) live in `carelink-chat` and wrap this type.

/// Core error type shared by configuration, local storage, and session handling.
#[derive(Debug, thiserror::Error)]
pub enum CareLinkError {
    // === Configuration ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Session ===
    #[error("Unknown user role: {role}")]
    UnknownRole { role: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    // === Local storage ===
    #[error("Local store error at {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Logging ===
    #[error("Logging already initialized: {0}")]
    Logging(String),
}

impl CareLinkError {
    /// Error code string for programmatic handling by UI layers.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::UnknownRole { .. } => "UNKNOWN_ROLE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Store { .. } => "STORE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Logging(_) => "LOGGING_ERROR",
        }
    }
}

/// Convenience type alias for Results using CareLinkError.
pub type CareLinkResult<T> = Result<T, CareLinkError>;
