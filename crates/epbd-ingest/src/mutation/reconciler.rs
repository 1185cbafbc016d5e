//! Sequence Reconciler
//!
//! Brings the store up to date from a requested date:
//!
//! 1. The requested date's batch chains onto the store: apply it, then walk
//!    forward day by day.
//! 2. It skips ahead (gap): cache it and walk back one day at a time until a
//!    batch with `last + 1` turns up, apply that, replay the cached days in
//!    ascending order, then walk forward.
//! 3. It was already applied, or the store is ahead: nothing to do.
//!
//! The backward walk never crosses the first day of the month, since the
//! provider keeps no history beyond it, and never exceeds
//! `max_lookback_days`. Exhausting it is fatal and needs a full refresh.

use chrono::{Datelike, NaiveDate};
use epbd_common::checksum::short_digest;
use tracing::{debug, info, warn};

use super::cache::PendingBatchCache;
use super::transformer::{SequenceCheck, SequenceRejection, Transformed, Transformer};
use super::DEFAULT_MAX_LOOKBACK_DAYS;
use crate::config::default_mutation_date;
use crate::error::{IngestError, Result};
use crate::feed::MutationFeed;
use crate::models::ParsedBatch;
use crate::storage::MutationSink;

// ============================================================================
// Report
// ============================================================================

/// One batch committed during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    pub date: NaiveDate,
    pub sequence: i64,
    pub inserts: usize,
    pub deletes: usize,
    /// Short SHA-256 of the payload
    pub digest: String,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    /// Zero or more batches applied; the store is as current as the feed allows
    Applied,
    /// The requested date's batch is the one last applied
    UpToDate { sequence: i64 },
    /// The store holds a newer sequence than the requested date's batch
    StoreAhead { store: i64, feed: i64 },
    /// Nothing is published for the requested date
    NotPublished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub start: NaiveDate,
    /// Commit order
    pub applied: Vec<AppliedBatch>,
    pub status: ReconcileStatus,
}

impl ReconcileReport {
    pub fn applied_dates(&self) -> Vec<NaiveDate> {
        self.applied.iter().map(|b| b.date).collect()
    }

    /// Sequence of the last batch this run applied
    pub fn final_sequence(&self) -> Option<i64> {
        self.applied.last().map(|b| b.sequence)
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// State of one run. Dropped (and the cache with it) when the run ends.
struct Run {
    start: NaiveDate,
    last: i64,
    cache: PendingBatchCache,
    applied: Vec<AppliedBatch>,
}

impl Run {
    fn finish(self, status: ReconcileStatus) -> ReconcileReport {
        if !self.cache.is_empty() {
            debug!(dates = ?self.cache.dates(), "Discarding unused cached payloads");
        }
        ReconcileReport {
            start: self.start,
            applied: self.applied,
            status,
        }
    }
}

pub struct Reconciler<F, S> {
    feed: F,
    sink: S,
    force: bool,
    horizon: NaiveDate,
    max_lookback_days: u32,
}

impl<F: MutationFeed, S: MutationSink> Reconciler<F, S> {
    pub fn new(feed: F, sink: S) -> Self {
        Self {
            feed,
            sink,
            force: false,
            horizon: default_mutation_date(),
            max_lookback_days: DEFAULT_MAX_LOOKBACK_DAYS,
        }
    }

    /// Apply only the requested date, without sequence validation
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Latest date the forward walk may fetch
    pub fn horizon(mut self, horizon: NaiveDate) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn max_lookback_days(mut self, days: u32) -> Self {
        self.max_lookback_days = days;
        self
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Reconcile the store starting from `start`
    pub async fn reconcile(&self, start: NaiveDate) -> Result<ReconcileReport> {
        let last = self.sink.last_sequence().await?;
        info!(date = %start, last_sequence = last, force = self.force, "Starting mutation update");

        let mut run = Run {
            start,
            last,
            cache: PendingBatchCache::new(),
            applied: Vec::new(),
        };

        let Some(payload) = self.feed.fetch(start).await? else {
            warn!(date = %start, "No mutation file published for requested date");
            return Ok(run.finish(ReconcileStatus::NotPublished));
        };

        if self.force {
            return self.force_apply(run, payload).await;
        }

        let transformer = Transformer::new(SequenceCheck::Enforce);
        match transformer.transform(&payload, run.last)? {
            Transformed::Ready(batch) => {
                self.apply(&mut run, start, batch, &payload).await?;
            },
            Transformed::Rejected(SequenceRejection::Duplicate { sequence }) => {
                info!(date = %start, sequence, "Mutation already applied; store is up to date");
                return Ok(run.finish(ReconcileStatus::UpToDate { sequence }));
            },
            Transformed::Rejected(SequenceRejection::Regression { sequence, last }) => {
                info!(
                    date = %start,
                    sequence,
                    last_sequence = last,
                    "Store is ahead of the requested mutation; nothing to apply"
                );
                return Ok(run.finish(ReconcileStatus::StoreAhead { store: last, feed: sequence }));
            },
            Transformed::Rejected(SequenceRejection::Gap { sequence, last }) => {
                info!(
                    date = %start,
                    sequence,
                    last_sequence = last,
                    "Mutation sequence gap; searching earlier dates"
                );
                run.cache.insert(start, payload);
                let matched = self.search_backward(&mut run).await?;
                self.replay_cached(&mut run, matched).await?;
            },
        }

        self.walk_forward(&mut run).await?;

        info!(
            applied = run.applied.len(),
            last_sequence = run.last,
            "Mutation update complete"
        );
        Ok(run.finish(ReconcileStatus::Applied))
    }

    async fn force_apply(&self, mut run: Run, payload: Vec<u8>) -> Result<ReconcileReport> {
        let transformer = Transformer::new(SequenceCheck::Bypass);
        match transformer.transform(&payload, run.last)? {
            Transformed::Ready(batch) => {
                let date = run.start;
                self.apply(&mut run, date, batch, &payload).await?;
                Ok(run.finish(ReconcileStatus::Applied))
            },
            // Bypass never rejects
            Transformed::Rejected(rejection) => Err(rejection.into()),
        }
    }

    /// Walk back from the start date until a batch chains onto the store.
    ///
    /// Applies the matching batch and returns its date. Gapped batches met
    /// on the way are cached for the replay.
    async fn search_backward(&self, run: &mut Run) -> Result<NaiveDate> {
        let transformer = Transformer::new(SequenceCheck::Enforce);
        let mut date = run.start;
        let mut steps = 0u32;

        loop {
            if date.day() == 1 || steps >= self.max_lookback_days {
                return Err(exhausted(run.last, date));
            }
            let Some(previous) = date.pred_opt() else {
                return Err(exhausted(run.last, date));
            };
            date = previous;
            steps += 1;

            let payload = match run.cache.take(date) {
                Some(payload) => Some(payload),
                None => self.feed.fetch(date).await?,
            };
            let Some(payload) = payload else {
                info!(date = %date, "No mutation file published; continuing backward");
                continue;
            };

            match transformer.transform(&payload, run.last)? {
                Transformed::Ready(batch) => {
                    info!(date = %date, sequence = batch.sequence, steps, "Found missing mutation");
                    self.apply(run, date, batch, &payload).await?;
                    return Ok(date);
                },
                Transformed::Rejected(SequenceRejection::Gap { sequence, .. }) => {
                    info!(date = %date, sequence, "Still ahead of the store; continuing backward");
                    run.cache.insert(date, payload);
                },
                Transformed::Rejected(rejection) => {
                    // An older batch precedes the gap, so the successor was never published
                    warn!(date = %date, "Backward search hit {}", rejection);
                    return Err(exhausted(run.last, date));
                },
            }
        }
    }

    /// Apply the cached batches after `matched`, up to and including the start date
    async fn replay_cached(&self, run: &mut Run, matched: NaiveDate) -> Result<()> {
        let transformer = Transformer::new(SequenceCheck::Enforce);
        let dates: Vec<NaiveDate> = run
            .cache
            .dates()
            .into_iter()
            .filter(|d| *d > matched && *d <= run.start)
            .collect();

        for date in dates {
            let Some(payload) = run.cache.take(date) else {
                continue;
            };
            match transformer.transform(&payload, run.last)? {
                Transformed::Ready(batch) => {
                    self.apply(run, date, batch, &payload).await?;
                },
                Transformed::Rejected(rejection) => {
                    warn!(date = %date, "Cached mutation no longer chains: {}", rejection);
                    return Err(exhausted(run.last, matched));
                },
            }
        }

        Ok(())
    }

    /// Fetch and apply the days after the start date while they keep chaining
    async fn walk_forward(&self, run: &mut Run) -> Result<()> {
        let transformer = Transformer::new(SequenceCheck::Enforce);
        let mut date = run.start;

        loop {
            date = match date.succ_opt() {
                Some(next) if next <= self.horizon => next,
                _ => break,
            };

            let Some(payload) = self.feed.fetch(date).await? else {
                info!(date = %date, "No newer mutation published yet");
                break;
            };

            match transformer.transform(&payload, run.last)? {
                Transformed::Ready(batch) => {
                    self.apply(run, date, batch, &payload).await?;
                },
                Transformed::Rejected(rejection) => {
                    info!(date = %date, "Stopping forward walk: {}", rejection);
                    break;
                },
            }
        }

        Ok(())
    }

    async fn apply(
        &self,
        run: &mut Run,
        date: NaiveDate,
        batch: ParsedBatch,
        payload: &[u8],
    ) -> Result<()> {
        let batch = batch.dated(date);
        let applied = AppliedBatch {
            date,
            sequence: batch.sequence,
            inserts: batch.insert_count(),
            deletes: batch.delete_count(),
            digest: short_digest(payload),
        };

        self.sink.apply(&batch, Some(run.last)).await?;

        info!(
            date = %date,
            sequence = applied.sequence,
            inserts = applied.inserts,
            deletes = applied.deletes,
            digest = %applied.digest,
            "Applied mutation batch"
        );
        run.last = batch.sequence;
        run.applied.push(applied);
        Ok(())
    }
}

fn exhausted(last: i64, searched_to: NaiveDate) -> IngestError {
    IngestError::IrreconcilableGap { last, searched_to }
}
