//! Scrape pass over the configured namespaces.
//!
//! A scrape lists every secret of every configured namespace, draining all
//! pages, and folds each certificate found in the secret values into the
//! notAfter and notBefore gauge vectors handed in by the caller. Values that
//! are not certificates are skipped silently.

use prometheus::GaugeVec;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ScrapeConfiguration;
use crate::error::{ListingError, ScrapeError};
use crate::source::{ListRequest, SecretPage, SecretSource};
use crate::ParsedCertificate;

/// Counters describing one completed scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    pub namespaces: usize,
    pub pages: usize,
    pub secrets: usize,
    /// Secret values parsed as certificates
    pub certificates: usize,
    /// Secret values that were not certificates
    pub skipped: usize,
}

/// Lists secrets and extracts certificate validity windows.
///
/// The scraper holds no per-scrape state, so one instance can serve any
/// number of concurrent scrapes.
pub struct Scraper<S: ?Sized> {
    config: ScrapeConfiguration,
    source: Arc<S>,
}

impl<S: SecretSource + ?Sized> Scraper<S> {
    pub fn new(config: ScrapeConfiguration, source: Arc<S>) -> Self {
        Scraper { config, source }
    }

    /// Runs one scrape pass, writing into `not_after` and `not_before`.
    ///
    /// Both vectors must carry the `cn`, `o`, `ou` labels. Certificates sharing
    /// the same label values overwrite each other, the last one processed wins.
    ///
    /// # Errors
    ///
    /// Any listing failure that survives the retry policy aborts the whole
    /// scrape. When a deadline is configured and exceeded the scrape fails with
    /// `ScrapeError::Timeout`. On error the vectors may be partially filled and
    /// must be discarded.
    pub async fn scrape(
        &self,
        not_after: &GaugeVec,
        not_before: &GaugeVec,
    ) -> Result<ScrapeStats, ScrapeError> {
        let pass = self.scrape_namespaces(not_after, not_before);
        match self.config.timeout {
            Some(after) => tokio::time::timeout(after, pass)
                .await
                .map_err(|_| ScrapeError::Timeout { after })?,
            None => pass.await,
        }
    }

    async fn scrape_namespaces(
        &self,
        not_after: &GaugeVec,
        not_before: &GaugeVec,
    ) -> Result<ScrapeStats, ScrapeError> {
        let mut stats = ScrapeStats::default();

        for namespace in &self.config.namespaces {
            let mut request = ListRequest {
                label_selector: self.config.label_selector.clone(),
                limit: self.config.page_limit,
                continue_token: None,
            };

            loop {
                let page = self.list_page(namespace, &request).await?;
                stats.pages += 1;

                for secret in &page.secrets {
                    stats.secrets += 1;
                    // Keys are ignored, every value is a candidate.
                    for value in secret.data.iter().flat_map(|data| data.values()) {
                        match ParsedCertificate::from_pem(&value.0) {
                            Ok(cert) => {
                                let key = cert.label_key();
                                not_after
                                    .with_label_values(&key.values())
                                    .set(cert.not_after as f64);
                                not_before
                                    .with_label_values(&key.values())
                                    .set(cert.not_before as f64);
                                stats.certificates += 1;
                            }
                            Err(_) => stats.skipped += 1,
                        }
                    }
                }

                match page.continue_token {
                    Some(token) if request.continue_token.as_deref() == Some(token.as_str()) => {
                        return Err(ListingError::Other {
                            namespace: namespace.clone(),
                            message: "continue token did not advance".to_string(),
                            transient: false,
                        }
                        .into());
                    }
                    Some(token) => request.continue_token = Some(token),
                    None => break,
                }
            }

            stats.namespaces += 1;
        }

        debug!(
            namespaces = stats.namespaces,
            pages = stats.pages,
            secrets = stats.secrets,
            certificates = stats.certificates,
            skipped = stats.skipped,
            "Scrape completed"
        );
        Ok(stats)
    }

    /// Lists one page, retrying transient failures with exponential backoff.
    async fn list_page(
        &self,
        namespace: &str,
        request: &ListRequest,
    ) -> Result<SecretPage, ListingError> {
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            match self.source.list_secrets(namespace, request).await {
                Ok(page) => {
                    if attempt > 0 {
                        debug!(namespace, attempt = attempt + 1, "Listing succeeded after retry");
                    }
                    return Ok(page);
                }
                Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        namespace,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient listing error, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
