//! Error taxonomy for mutation ingestion

use chrono::NaiveDate;
use thiserror::Error;

/// Result type for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Every way a mutation run can fail
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Mutation sequence {sequence} has already been applied")]
    DuplicateSequence { sequence: i64 },

    #[error("Mutation sequence {sequence} is older than the store's sequence {last}")]
    SequenceRegression { sequence: i64, last: i64 },

    #[error("Mutation sequence {sequence} skips ahead of the store's sequence {last}")]
    SequenceGap { sequence: i64, last: i64 },

    #[error("Malformed mutation document: {0}")]
    MalformedDocument(String),

    #[error("No XML file found in archive")]
    NoXmlInArchive,

    #[error("Locator error: {0}")]
    Locator(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Store sequence changed from {expected} to {actual} during apply")]
    ConcurrentUpdate { expected: i64, actual: i64 },

    #[error(
        "No mutation file continues sequence {last} (searched back to {searched_to}); \
         completely refresh the database using the full EPBD XML file"
    )]
    IrreconcilableGap { last: i64, searched_to: NaiveDate },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Outcomes an operator has to resolve by hand (a full refresh).
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::IrreconcilableGap { .. })
    }

    /// The three verdicts of comparing a batch against the store's sequence.
    pub fn is_sequence_rejection(&self) -> bool {
        matches!(
            self,
            IngestError::DuplicateSequence { .. }
                | IngestError::SequenceRegression { .. }
                | IngestError::SequenceGap { .. }
        )
    }
}

impl From<epbd_common::EpbdError> for IngestError {
    fn from(err: epbd_common::EpbdError) -> Self {
        match err {
            epbd_common::EpbdError::Io(e) => IngestError::Io(e),
            epbd_common::EpbdError::Config(message) => IngestError::Config(message),
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Fetch(err.to_string())
    }
}

impl From<zip::result::ZipError> for IngestError {
    fn from(err: zip::result::ZipError) -> Self {
        IngestError::Fetch(format!("Failed to read zip archive: {}", err))
    }
}
