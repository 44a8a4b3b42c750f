//! Switchboard error types

use thiserror::Error;

/// Result alias used throughout the crate
pub type SwitchboardResult<T> = Result<T, SwitchboardError>;

/// Errors raised by the router and its subsystems
///
/// Every operation boundary converts these into readable text; only
/// genuinely unexpected internal faults are allowed to escape the process.
#[derive(Debug, Error, Clone)]
pub enum SwitchboardError {
    /// Malformed registry or hooks file; aborts that load only
    #[error("Configuration error: {0}")]
    Config(String),

    /// Spawn, handshake, or tool-list failure while starting a server
    #[error("Failed to start server '{server}': {message}")]
    Startup { server: String, message: String },

    /// Timeout, transport-level failure, or an error envelope from the server
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unknown server or tool
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server is explicitly disabled
    #[error("Server '{0}' is disabled")]
    Disabled(String),

    /// Start requested for a server that is already up
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    /// Server is outside the caller's allowed scope
    #[error("Permission denied: {0}")]
    Permission(String),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal fault
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwitchboardError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn startup(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Startup {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn timeout(secs: f64) -> Self {
        Self::Transport(format!("request timed out after {:.1}s", secs))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn disabled(server: impl Into<String>) -> Self {
        Self::Disabled(server.into())
    }

    pub fn already_running(server: impl Into<String>) -> Self {
        Self::AlreadyRunning(server.into())
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error came from the transport layer (including timeouts)
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for SwitchboardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SwitchboardError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
