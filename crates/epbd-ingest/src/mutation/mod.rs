// Daily Mutation Ingestion
//
// Applies the EP-Online daily mutation files to the certificate table in
// strict sequence order.
//
// - Transform: one document -> row operations + sequence verdict
// - Cache: payloads fetched during a backward search, keyed by date
// - Reconcile: backward search for the missing successor, forward replay

pub mod cache;
pub mod reconciler;
pub mod transformer;

pub use cache::PendingBatchCache;
pub use reconciler::{AppliedBatch, ReconcileReport, ReconcileStatus, Reconciler};
pub use transformer::{
    validate_sequence, SequenceCheck, SequenceRejection, Transformed, Transformer,
};

/// Upper bound on days walked back, on top of the day-of-month-1 boundary
pub const DEFAULT_MAX_LOOKBACK_DAYS: u32 = 31;
