use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Startup misconfiguration. Always fatal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("conflicting permission settings: {0} cannot be combined with {1}")]
    Contradictory(&'static str, &'static str),

    #[error("environment variable {name} has non-boolean value '{value}'")]
    InvalidEnv { name: &'static str, value: String },
}

/// Why the ownership tag of a resource could not be read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagLookupError {
    #[error("resource '{0}' does not exist")]
    ResourceNotFound(String),

    #[error("tag lookup for '{resource}' failed: {message}")]
    Failed { resource: String, message: String },

    #[error("tag lookup for '{0}' was cancelled")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, McpError>;
