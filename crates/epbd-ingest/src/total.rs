//! Full-refresh loader
//!
//! Builds the certificate table from the complete EPBD export. Every record
//! is an insert, records are committed in chunks, and the export's
//! `LaatstVerwerkteMutatieVolgnummer` becomes the store's sequence so the
//! daily mutations can continue from it.

use epbd_common::checksum::sha256_hex;
use std::path::Path;
use tracing::{debug, info};

use crate::document::{DocumentItem, DocumentKind, RecordReader};
use crate::error::{IngestError, Result};
use crate::feed::{is_zip, select_xml_member};
use crate::models::{CertificateFields, RowOperation};
use crate::storage::BulkSink;

/// Counts from one full-refresh load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotalLoadStats {
    pub records: usize,
    pub chunks: usize,
    pub sequence: i64,
}

/// Read a full export from disk, unpacking it when it is a zip archive
pub async fn read_export(path: &Path) -> Result<Vec<u8>> {
    let data = tokio::fs::read(path).await?;
    info!(
        path = %path.display(),
        bytes = data.len(),
        sha256 = %sha256_hex(&data),
        "Read full export"
    );
    if is_zip(&data) {
        debug!(path = %path.display(), "Export is a zip archive");
        return select_xml_member(&data, None);
    }
    Ok(data)
}

/// Load a full export into `sink` in chunks of `chunk_size` records.
///
/// A malformed document stops the load; chunks committed before the error
/// stay in place and the sequence is not recorded.
pub async fn load_total<S: BulkSink>(
    payload: &[u8],
    sink: &S,
    chunk_size: usize,
) -> Result<TotalLoadStats> {
    if chunk_size == 0 {
        return Err(IngestError::Config("chunk size must be greater than 0".to_string()));
    }

    sink.prepare().await?;

    let mut reader = RecordReader::new(payload, DocumentKind::FullRefresh);
    let mut chunk: Vec<CertificateFields> = Vec::with_capacity(chunk_size);
    let mut stats = TotalLoadStats {
        records: 0,
        chunks: 0,
        sequence: 0,
    };
    let mut sequence = None;

    while let Some(item) = reader.next_item()? {
        match item {
            DocumentItem::Record(RowOperation::Insert(fields)) => {
                chunk.push(fields);
                if chunk.len() == chunk_size {
                    flush(sink, &mut chunk, &mut stats).await?;
                }
            },
            DocumentItem::Record(RowOperation::Delete(_)) => {
                return Err(IngestError::MalformedDocument(
                    "full export contains a delete record".to_string(),
                ));
            },
            DocumentItem::Sequence(number) => sequence = Some(number),
        }
    }

    if !chunk.is_empty() {
        flush(sink, &mut chunk, &mut stats).await?;
    }

    // The reader refuses to finish a document without a sequence element
    let sequence = sequence.ok_or_else(|| {
        IngestError::MalformedDocument("document ended without a sequence number".to_string())
    })?;
    sink.record_sequence(sequence).await?;
    stats.sequence = sequence;

    info!(
        records = stats.records,
        chunks = stats.chunks,
        sequence = stats.sequence,
        "Full refresh complete"
    );
    Ok(stats)
}

async fn flush<S: BulkSink>(
    sink: &S,
    chunk: &mut Vec<CertificateFields>,
    stats: &mut TotalLoadStats,
) -> Result<()> {
    sink.insert_chunk(chunk.as_slice()).await?;
    stats.records += chunk.len();
    stats.chunks += 1;
    debug!(chunk = stats.chunks, records = stats.records, "Committed chunk");
    chunk.clear();
    Ok(())
}
