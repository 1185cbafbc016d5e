//! Record Transformer
//!
//! Turns one mutation document into an ordered list of row operations and
//! decides, from the document's sequence number, whether the batch may be
//! applied on top of the store's last applied sequence.
//!
//! Sequence verdicts are values, not errors: only a document that cannot be
//! read comes back as `Err(IngestError::MalformedDocument)`.

use std::fmt;
use tracing::{debug, warn};

use crate::document::{DocumentItem, DocumentKind, RecordReader};
use crate::error::{IngestError, Result};
use crate::models::ParsedBatch;

/// Whether the sequence number is checked against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceCheck {
    #[default]
    Enforce,
    /// Accept any sequence number. Bootstrap and manual override only.
    Bypass,
}

/// Why a batch may not be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceRejection {
    /// The batch has already been applied
    Duplicate { sequence: i64 },
    /// The store is ahead of the batch
    Regression { sequence: i64, last: i64 },
    /// At least one batch is missing between the store and this one
    Gap { sequence: i64, last: i64 },
}

impl SequenceRejection {
    pub fn sequence(&self) -> i64 {
        match *self {
            SequenceRejection::Duplicate { sequence }
            | SequenceRejection::Regression { sequence, .. }
            | SequenceRejection::Gap { sequence, .. } => sequence,
        }
    }
}

impl fmt::Display for SequenceRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SequenceRejection::Duplicate { sequence } => {
                write!(f, "sequence {} already applied", sequence)
            },
            SequenceRejection::Regression { sequence, last } => {
                write!(f, "sequence {} is older than store sequence {}", sequence, last)
            },
            SequenceRejection::Gap { sequence, last } => {
                write!(f, "sequence {} does not follow store sequence {}", sequence, last)
            },
        }
    }
}

impl From<SequenceRejection> for IngestError {
    fn from(rejection: SequenceRejection) -> Self {
        match rejection {
            SequenceRejection::Duplicate { sequence } => {
                IngestError::DuplicateSequence { sequence }
            },
            SequenceRejection::Regression { sequence, last } => {
                IngestError::SequenceRegression { sequence, last }
            },
            SequenceRejection::Gap { sequence, last } => {
                IngestError::SequenceGap { sequence, last }
            },
        }
    }
}

/// Result of transforming one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    Ready(ParsedBatch),
    Rejected(SequenceRejection),
}

/// Compare a batch's sequence number with the store's.
///
/// Only `last + 1` is applicable.
pub fn validate_sequence(sequence: i64, last: i64) -> Option<SequenceRejection> {
    if sequence == last {
        Some(SequenceRejection::Duplicate { sequence })
    } else if sequence < last {
        Some(SequenceRejection::Regression { sequence, last })
    } else if sequence > last.saturating_add(1) {
        Some(SequenceRejection::Gap { sequence, last })
    } else {
        None
    }
}

/// Mutation document transformer
#[derive(Debug, Clone, Copy, Default)]
pub struct Transformer {
    check: SequenceCheck,
}

impl Transformer {
    pub fn new(check: SequenceCheck) -> Self {
        Self { check }
    }

    pub fn check(&self) -> SequenceCheck {
        self.check
    }

    /// Transform `payload` against the store's `last_sequence`.
    ///
    /// A rejected batch yields no operations at all, whether the sequence
    /// element came before or after the records. The whole document is read
    /// before a verdict is returned, so a malformed tail is an error even
    /// when the sequence already decided the batch.
    pub fn transform(&self, payload: &[u8], last_sequence: i64) -> Result<Transformed> {
        let mut reader = RecordReader::new(payload, DocumentKind::Mutation);
        let mut operations = Vec::new();
        let mut sequence = None;
        let mut rejected = None;

        while let Some(item) = reader.next_item()? {
            match item {
                DocumentItem::Record(op) => {
                    if rejected.is_none() {
                        operations.push(op);
                    }
                },
                DocumentItem::Sequence(number) => {
                    match self.check {
                        SequenceCheck::Enforce => {
                            if let Some(rejection) = validate_sequence(number, last_sequence) {
                                debug!(
                                    sequence = number,
                                    last = last_sequence,
                                    records_read = reader.records(),
                                    "Mutation batch rejected: {}",
                                    rejection
                                );
                                operations.clear();
                                rejected = Some(rejection);
                            }
                        },
                        SequenceCheck::Bypass => {
                            warn!(
                                sequence = number,
                                last = last_sequence,
                                "Sequence validation bypassed (force); the store may diverge \
                                 from the feed"
                            );
                        },
                    }
                    sequence = Some(number);
                },
            }
        }

        if let Some(rejection) = rejected {
            return Ok(Transformed::Rejected(rejection));
        }

        match sequence {
            Some(sequence) => Ok(Transformed::Ready(ParsedBatch { operations, sequence })),
            None => Err(IngestError::MalformedDocument(
                "document ended without a sequence number".to_string(),
            )),
        }
    }
}
