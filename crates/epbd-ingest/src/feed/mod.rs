//! EP-Online mutation feed
//!
//! Resolving a date to a download URL is a SOAP call; the URL points at a zip
//! archive holding that day's mutation document.

pub mod archive;
pub mod client;
pub mod soap;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;

pub use archive::{is_zip, select_xml_member};
pub use client::EpOnlineFeed;

/// Source of daily mutation documents
#[async_trait]
pub trait MutationFeed: Send + Sync {
    /// The mutation document published for `date`, decompressed.
    ///
    /// `Ok(None)` means nothing is published for that date (yet).
    async fn fetch(&self, date: NaiveDate) -> Result<Option<Vec<u8>>>;
}
