//! Postgres persistence for certificates and the applied sequence number
//!
//! Tables (schema and table name configurable):
//!
//! - `{schema}.{table}`: one column per certificate field
//! - `{schema}.laatste_volgnummer`: a single `volgnummer` row holding the
//!   sequence of the last applied batch

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info};

use crate::config::{is_valid_identifier, DatabaseConfig};
use crate::error::{IngestError, Result};
use crate::models::{CertificateFields, DeleteKey, Field, MutationBatch, RowOperation};

/// Table holding the last applied sequence number
pub const SEQUENCE_TABLE: &str = "laatste_volgnummer";

/// Target of the daily mutation path
#[async_trait]
pub trait MutationSink: Send + Sync {
    /// Sequence number of the last applied batch
    async fn last_sequence(&self) -> Result<i64>;

    /// Apply every operation of `batch` and advance the sequence, atomically.
    ///
    /// With `expected_last`, fails with `ConcurrentUpdate` when the stored
    /// sequence is no longer that value. Nothing is written on failure.
    async fn apply(&self, batch: &MutationBatch, expected_last: Option<i64>) -> Result<()>;
}

/// Target of the full-refresh loader
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Create the schema, the certificate table and the sequence table (seeded with 0)
    async fn prepare(&self) -> Result<()>;

    /// Insert one chunk of records in its own transaction
    async fn insert_chunk(&self, records: &[CertificateFields]) -> Result<()>;

    async fn record_sequence(&self, sequence: i64) -> Result<()>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(config.connect_options())
            .await?;

        info!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            table = %config.qualified_table(),
            "Connected to database"
        );

        Self::from_pool(pool, &config.schema, &config.table)
    }

    pub fn from_pool(pool: PgPool, schema: &str, table: &str) -> Result<Self> {
        for name in [schema, table] {
            if !is_valid_identifier(name) {
                return Err(IngestError::Config(format!("Invalid SQL identifier '{}'", name)));
            }
        }

        Ok(Self {
            pool,
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn certificate_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    fn sequence_table(&self) -> String {
        format!("{}.{}", self.schema, SEQUENCE_TABLE)
    }

    /// `CREATE TABLE` for the certificate table
    pub fn create_table_statement(&self) -> String {
        let columns: Vec<String> = Field::ALL
            .iter()
            .map(|f| format!("{} {}", f.column(), f.column_type().ddl()))
            .collect();
        format!("CREATE TABLE {} ({})", self.certificate_table(), columns.join(", "))
    }

    /// `INSERT` naming only the present fields, each bound as text and cast
    pub fn insert_statement(&self, fields: &CertificateFields) -> String {
        let mut columns = Vec::with_capacity(fields.len());
        let mut params = Vec::with_capacity(fields.len());
        for (i, (field, _)) in fields.iter().enumerate() {
            columns.push(field.column());
            params.push(format!("${}::{}", i + 1, field.column_type().cast()));
        }
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.certificate_table(),
            columns.join(", "),
            params.join(", ")
        )
    }

    pub fn delete_statement(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {} = $1 AND {} = $2 AND {} = $3::integer",
            self.certificate_table(),
            Field::BuildingObjectId.column(),
            Field::PostalCode.column(),
            Field::HouseNumber.column()
        )
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        fields: &CertificateFields,
    ) -> Result<()> {
        let sql = self.insert_statement(fields);
        let mut query = sqlx::query(&sql);
        for (_, value) in fields.iter() {
            query = query.bind(value);
        }
        query.execute(&mut **tx).await?;
        Ok(())
    }

    async fn delete(&self, tx: &mut Transaction<'_, Postgres>, key: &DeleteKey) -> Result<u64> {
        let sql = self.delete_statement();
        let result = sqlx::query(&sql)
            .bind(&key.building_object_id)
            .bind(&key.postal_code)
            .bind(&key.house_number)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_sequence(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        sequence: i64,
    ) -> Result<()> {
        let sql = format!("UPDATE {} SET volgnummer = $1::integer", self.sequence_table());
        sqlx::query(&sql).bind(sequence).execute(&mut **tx).await?;
        Ok(())
    }

    fn missing_sequence_row(&self) -> IngestError {
        IngestError::Config(format!(
            "{} has no sequence row; load the full EPBD XML file first",
            self.sequence_table()
        ))
    }
}

#[async_trait]
impl MutationSink for PgStore {
    async fn last_sequence(&self) -> Result<i64> {
        let sql = format!("SELECT volgnummer::bigint FROM {}", self.sequence_table());
        let sequence: Option<i64> = sqlx::query_scalar(&sql).fetch_optional(&self.pool).await?;
        sequence.ok_or_else(|| self.missing_sequence_row())
    }

    async fn apply(&self, batch: &MutationBatch, expected_last: Option<i64>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT volgnummer::bigint FROM {} FOR UPDATE", self.sequence_table());
        let current: Option<i64> = sqlx::query_scalar(&sql).fetch_optional(&mut *tx).await?;
        let current = current.ok_or_else(|| self.missing_sequence_row())?;

        if let Some(expected) = expected_last {
            if current != expected {
                return Err(IngestError::ConcurrentUpdate {
                    expected,
                    actual: current,
                });
            }
        }

        let mut deleted = 0u64;
        for operation in &batch.operations {
            match operation {
                RowOperation::Insert(fields) => self.insert(&mut tx, fields).await?,
                RowOperation::Delete(key) => deleted += self.delete(&mut tx, key).await?,
            }
        }

        self.write_sequence(&mut tx, batch.sequence).await?;
        tx.commit().await?;

        debug!(
            date = %batch.date,
            sequence = batch.sequence,
            rows_deleted = deleted,
            "Committed mutation batch"
        );
        Ok(())
    }
}

#[async_trait]
impl BulkSink for PgStore {
    async fn prepare(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.create_table_statement()).execute(&mut *tx).await?;
        sqlx::query(&format!("CREATE TABLE {} (volgnummer integer)", self.sequence_table()))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("INSERT INTO {} (volgnummer) VALUES (0)", self.sequence_table()))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(table = %self.certificate_table(), "Created certificate tables");
        Ok(())
    }

    async fn insert_chunk(&self, records: &[CertificateFields]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for fields in records {
            self.insert(&mut tx, fields).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_sequence(&self, sequence: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.write_sequence(&mut tx, sequence).await?;
        tx.commit().await?;
        Ok(())
    }
}
