//! Error types for cartcheck

use thiserror::Error;

/// Result type alias using the cartcheck common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared data layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Malformed CSV record at byte {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: String },

    #[error("Subject source error: {0}")]
    SubjectSource(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),
}
