//! Shared fakes and fixtures for epbd-ingest integration tests
//!
//! - `MemoryFeed`: date -> payload map that records every fetch
//! - `MemoryStore`: transactional in-memory store with a unique key on
//!   (object id, postal code, house number)
//! - document builders for mutation and full-refresh XML

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use epbd_ingest::error::{IngestError, Result};
use epbd_ingest::feed::MutationFeed;
use epbd_ingest::models::{CertificateFields, Field, MutationBatch, RowOperation};
use epbd_ingest::storage::{BulkSink, MutationSink};
use std::collections::HashMap;
use std::sync::Mutex;

pub fn day(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, month, day).unwrap()
}

// ============================================================================
// Documents
// ============================================================================

/// Insert record with the three key fields and an energy class
pub fn insert(postcode: &str, number: u32, object_id: &str) -> String {
    format!(
        "<Pandcertificaat><Stuurcode>1</Stuurcode>\
         <Pand_postcode>{}</Pand_postcode><Pand_huisnummer>{}</Pand_huisnummer>\
         <Pand_bagverblijfsobjectid>{}</Pand_bagverblijfsobjectid>\
         <Pand_energieklasse>A</Pand_energieklasse></Pandcertificaat>",
        postcode, number, object_id
    )
}

pub fn delete(postcode: &str, number: u32, object_id: &str) -> String {
    format!(
        "<Pandcertificaat><Stuurcode>2</Stuurcode>\
         <Pand_postcode>{}</Pand_postcode><Pand_huisnummer>{}</Pand_huisnummer>\
         <Pand_bagverblijfsobjectid>{}</Pand_bagverblijfsobjectid></Pandcertificaat>",
        postcode, number, object_id
    )
}

pub fn mutation_document(sequence: i64, records: &[String]) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Mutatiebericht>{}\
         <Mutatievolgnummer>{}</Mutatievolgnummer></Mutatiebericht>",
        records.concat(),
        sequence
    )
    .into_bytes()
}

/// Mutation document with one insert, numbered after its sequence
pub fn simple_mutation(sequence: i64) -> Vec<u8> {
    mutation_document(
        sequence,
        &[insert("1000AA", sequence as u32, &format!("0363{:012}", sequence))],
    )
}

/// Full-refresh document with `count` certificates
pub fn full_export(count: usize, sequence: i64) -> Vec<u8> {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Pandcertificaten>");
    for i in 0..count {
        xml.push_str(&format!(
            "<Pandcertificaat><Pand_postcode>2000BB</Pand_postcode>\
             <Pand_huisnummer>{}</Pand_huisnummer>\
             <Pand_bagverblijfsobjectid>0599{:012}</Pand_bagverblijfsobjectid>\
             <Pand_registratiedatum>2023-11-02</Pand_registratiedatum></Pandcertificaat>",
            i + 1,
            i + 1
        ));
    }
    xml.push_str(&format!(
        "<LaatstVerwerkteMutatieVolgnummer>{}</LaatstVerwerkteMutatieVolgnummer></Pandcertificaten>",
        sequence
    ));
    xml.into_bytes()
}

pub fn row(postcode: &str, number: u32, object_id: &str) -> CertificateFields {
    CertificateFields::new()
        .with(Field::PostalCode, postcode)
        .with(Field::HouseNumber, number.to_string())
        .with(Field::BuildingObjectId, object_id)
        .with(Field::EnergyClass, "A")
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Default)]
pub struct MemoryFeed {
    payloads: HashMap<NaiveDate, Vec<u8>>,
    fetches: Mutex<Vec<NaiveDate>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, date: NaiveDate, payload: Vec<u8>) -> Self {
        self.payloads.insert(date, payload);
        self
    }

    /// Dates fetched, in call order
    pub fn fetches(&self) -> Vec<NaiveDate> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, date: NaiveDate) -> usize {
        self.fetches().iter().filter(|d| **d == date).count()
    }
}

#[async_trait]
impl MutationFeed for MemoryFeed {
    async fn fetch(&self, date: NaiveDate) -> Result<Option<Vec<u8>>> {
        self.fetches.lock().unwrap().push(date);
        Ok(self.payloads.get(&date).cloned())
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Default)]
struct StoreState {
    rows: Vec<CertificateFields>,
    sequence: i64,
    /// Sequence after every committed apply
    history: Vec<i64>,
    prepared: bool,
    chunks: Vec<usize>,
}

type RowKey = (Option<String>, Option<String>, Option<String>);

fn row_key(fields: &CertificateFields) -> RowKey {
    (
        fields.get(Field::BuildingObjectId).map(str::to_string),
        fields.get(Field::PostalCode).map(str::to_string),
        fields.get(Field::HouseNumber).map(str::to_string),
    )
}

fn constraint_violation(fields: &CertificateFields) -> IngestError {
    IngestError::Persistence(sqlx::Error::Protocol(format!(
        "duplicate key value violates unique constraint: {:?}",
        row_key(fields)
    )))
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn at(sequence: i64) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().sequence = sequence;
        store
    }

    pub fn with_row(self, fields: CertificateFields) -> Self {
        self.state.lock().unwrap().rows.push(fields);
        self
    }

    pub fn sequence(&self) -> i64 {
        self.state.lock().unwrap().sequence
    }

    pub fn rows(&self) -> Vec<CertificateFields> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn history(&self) -> Vec<i64> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn is_prepared(&self) -> bool {
        self.state.lock().unwrap().prepared
    }

    pub fn chunks(&self) -> Vec<usize> {
        self.state.lock().unwrap().chunks.clone()
    }

    pub fn has_row(&self, postcode: &str, number: u32, object_id: &str) -> bool {
        let key = row_key(&row(postcode, number, object_id));
        self.rows().iter().any(|r| row_key(r) == key)
    }
}

fn insert_row(rows: &mut Vec<CertificateFields>, fields: &CertificateFields) -> Result<()> {
    let key = row_key(fields);
    if rows.iter().any(|r| row_key(r) == key) {
        return Err(constraint_violation(fields));
    }
    rows.push(fields.clone());
    Ok(())
}

#[async_trait]
impl MutationSink for MemoryStore {
    async fn last_sequence(&self) -> Result<i64> {
        Ok(self.sequence())
    }

    async fn apply(&self, batch: &MutationBatch, expected_last: Option<i64>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(expected) = expected_last {
            if state.sequence != expected {
                return Err(IngestError::ConcurrentUpdate {
                    expected,
                    actual: state.sequence,
                });
            }
        }

        // Work on a copy; only a fully applied batch replaces the rows
        let mut rows = state.rows.clone();
        for operation in &batch.operations {
            match operation {
                RowOperation::Insert(fields) => insert_row(&mut rows, fields)?,
                RowOperation::Delete(key) => rows.retain(|r| {
                    row_key(r)
                        != (
                            Some(key.building_object_id.clone()),
                            Some(key.postal_code.clone()),
                            Some(key.house_number.clone()),
                        )
                }),
            }
        }

        state.rows = rows;
        state.sequence = batch.sequence;
        state.history.push(batch.sequence);
        Ok(())
    }
}

#[async_trait]
impl BulkSink for MemoryStore {
    async fn prepare(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.prepared = true;
        state.sequence = 0;
        Ok(())
    }

    async fn insert_chunk(&self, records: &[CertificateFields]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut rows = state.rows.clone();
        for fields in records {
            insert_row(&mut rows, fields)?;
        }
        state.rows = rows;
        state.chunks.push(records.len());
        Ok(())
    }

    async fn record_sequence(&self, sequence: i64) -> Result<()> {
        self.state.lock().unwrap().sequence = sequence;
        Ok(())
    }
}
