//! EPBD Ingest Library
//!
//! Keeps a Postgres copy of the Dutch EPBD energy-label registry current
//! with the daily mutation files published through EP-Online.
//!
//! # Modules
//!
//! - [`document`]: streaming reader for certificate documents
//! - [`mutation`]: record transformer and sequence reconciler
//! - [`feed`]: SOAP locator, archive download and extraction
//! - [`storage`]: Postgres store for certificates and the applied sequence
//! - [`total`]: full-refresh loader that seeds the store
//!
//! # Example
//!
//! ```no_run
//! use epbd_ingest::config::{DatabaseConfig, FeedConfig};
//! use epbd_ingest::feed::EpOnlineFeed;
//! use epbd_ingest::mutation::Reconciler;
//! use epbd_ingest::storage::PgStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let database = DatabaseConfig::new("localhost", "epbd", "epbd", "labels")
//!         .with_credentials("epbd", "secret");
//!     let store = PgStore::connect(&database).await?;
//!     let feed = EpOnlineFeed::new(FeedConfig::new("user", "password"))?;
//!
//!     let date = epbd_ingest::config::default_mutation_date();
//!     let report = Reconciler::new(feed, store).reconcile(date).await?;
//!     tracing::info!(applied = report.applied.len(), "Update finished");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod feed;
pub mod models;
pub mod mutation;
pub mod storage;
pub mod total;

pub use error::{IngestError, Result};
