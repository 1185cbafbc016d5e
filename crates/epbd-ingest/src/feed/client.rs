//! HTTP client for the EP-Online download service

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::archive::select_xml_member;
use super::soap::{build_envelope, parse_response, LocatorResponse};
use super::MutationFeed;
use crate::config::FeedConfig;
use crate::error::{IngestError, Result};

/// Outcome of one failed attempt
enum AttemptError {
    /// Transport failure or 5xx; worth another try
    Retry(IngestError),
    Fail(IngestError),
}

/// Locates and downloads daily mutation files
pub struct EpOnlineFeed {
    client: Client,
    config: FeedConfig,
}

impl EpOnlineFeed {
    pub fn new(config: FeedConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Resolve the download URL for `date`; `None` when nothing is published.
    pub async fn locate(&self, date: NaiveDate) -> Result<Option<String>> {
        let envelope = build_envelope(&self.config.username, &self.config.password, date);

        self.with_retry("locate", || self.locate_once(envelope.clone())).await
    }

    async fn locate_once(
        &self,
        envelope: String,
    ) -> std::result::Result<Option<String>, AttemptError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", self.config.soap_action.as_str())
            .body(envelope)
            .send()
            .await
            .map_err(|e| AttemptError::Retry(IngestError::Locator(e.to_string())))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Retry(IngestError::Locator(e.to_string())))?;

        // ASMX services report SOAP faults with HTTP 500
        match parse_response(&body) {
            Ok(LocatorResponse::Fault(message)) => Err(AttemptError::Fail(IngestError::Locator(
                format!("SOAP fault: {}", message),
            ))),
            Ok(LocatorResponse::Url(url)) if status.is_success() => Ok(Some(url)),
            Ok(LocatorResponse::NotPublished) if status.is_success() => Ok(None),
            Err(e) if status.is_success() => Err(AttemptError::Fail(e)),
            _ => {
                let err = IngestError::Locator(format!("Locator returned HTTP {}", status));
                if status.is_server_error() {
                    Err(AttemptError::Retry(err))
                } else {
                    Err(AttemptError::Fail(err))
                }
            },
        }
    }

    /// Download the archive at `url`; `None` on HTTP 404.
    pub async fn download(&self, url: &str) -> Result<Option<Vec<u8>>> {
        self.with_retry("download", || self.download_once(url)).await
    }

    async fn download_once(
        &self,
        url: &str,
    ) -> std::result::Result<Option<Vec<u8>>, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptError::Retry(IngestError::Fetch(e.to_string())))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let err = IngestError::Fetch(format!("HTTP error: {} for {}", status, url));
            return Err(if status.is_server_error() {
                AttemptError::Retry(err)
            } else {
                AttemptError::Fail(err)
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Retry(IngestError::Fetch(e.to_string())))?;
        Ok(Some(bytes.to_vec()))
    }

    /// Run `attempt` up to `max_retries` times with exponential backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let max = self.config.max_retries.max(1);
        let mut number = 1;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fail(err)) => return Err(err),
                Err(AttemptError::Retry(err)) => {
                    warn!("{} attempt {}/{} failed: {}", what, number, max, err);
                    if number >= max {
                        return Err(err);
                    }

                    let backoff = self
                        .config
                        .retry_backoff_secs
                        .saturating_mul(2u64.saturating_pow(number - 1));
                    if backoff > 0 {
                        info!("Retrying in {} seconds...", backoff);
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    }
                    number += 1;
                },
            }
        }
    }
}

#[async_trait]
impl MutationFeed for EpOnlineFeed {
    async fn fetch(&self, date: NaiveDate) -> Result<Option<Vec<u8>>> {
        let Some(url) = self.locate(date).await? else {
            debug!(date = %date, "Locator returned no download URL");
            return Ok(None);
        };
        info!(date = %date, url = %url, "Downloading mutation archive");

        let Some(archive) = self.download(&url).await? else {
            warn!(date = %date, url = %url, "Mutation archive not found");
            return Ok(None);
        };
        debug!(date = %date, bytes = archive.len(), "Downloaded mutation archive");

        let document = select_xml_member(&archive, Some(date))?;
        Ok(Some(document))
    }
}
