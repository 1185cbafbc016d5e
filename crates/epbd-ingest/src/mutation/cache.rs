//! Payloads downloaded during one reconciliation run but not yet applicable

use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Date-keyed payload cache, scoped to a single run and never persisted
#[derive(Debug, Default)]
pub struct PendingBatchCache {
    payloads: BTreeMap<NaiveDate, Vec<u8>>,
}

impl PendingBatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: NaiveDate, payload: Vec<u8>) {
        self.payloads.insert(date, payload);
    }

    /// Remove and return the payload for `date`
    pub fn take(&mut self, date: NaiveDate) -> Option<Vec<u8>> {
        self.payloads.remove(&date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.payloads.contains_key(&date)
    }

    /// Cached dates, ascending
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.payloads.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn clear(&mut self) {
        self.payloads.clear();
    }
}
