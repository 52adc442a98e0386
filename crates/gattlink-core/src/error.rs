//! Unified error handling for the gateway.
//!
//! Crate-level operations that can fail outside the protocol engine itself
//! (configuration loading, logging setup) report through this type.

/// Unified error type for gattlink.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to read a configuration or credential file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML configuration.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Logging subscriber could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),
}

impl Error {
    /// Build a configuration error from anything printable.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

/// Result type alias using the unified error.
pub type Result<T> = std::result::Result<T, Error>;
