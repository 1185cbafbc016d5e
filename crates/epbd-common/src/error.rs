//! Error types shared by the EPBD crates

use thiserror::Error;

/// Result type alias for shared EPBD operations
pub type Result<T> = std::result::Result<T, EpbdError>;

/// Errors that are not specific to the mutation feed
#[derive(Error, Debug)]
pub enum EpbdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
