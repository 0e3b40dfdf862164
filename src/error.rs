//! Error types for certificate parsing and secret scraping.
//!
//! Parse failures are expected and recovered locally by the scraper. Listing
//! failures abort the scrape they occur in and are surfaced to the caller.

use std::time::Duration;
use thiserror::Error;

/// Error returned when a secret value cannot be turned into a certificate.
///
/// Secrets routinely carry non-certificate material (private keys, CA bundles
/// in other encodings, opaque blobs), so this error is part of normal operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// No PEM block could be decoded from the input
    #[error("Invalid PEM: no PEM block could be decoded")]
    InvalidPem,

    /// The PEM block did not wrap a valid DER-encoded X.509 certificate
    #[error("Certificate error: {reason}")]
    InvalidCertificate {
        /// Description of what went wrong
        reason: String,
    },
}

/// Error type for failed secret listing calls.
#[derive(Debug, Error)]
pub enum ListingError {
    /// The cluster API rejected or failed the request
    #[error("Failed to list secrets in namespace '{namespace}': {source}")]
    Api {
        /// The namespace that was being listed
        namespace: String,
        /// The underlying client error
        #[source]
        source: kube::Error,
    },

    /// A generic listing failure with a custom message
    #[error("Failed to list secrets in namespace '{namespace}': {message}")]
    Other {
        /// The namespace that was being listed
        namespace: String,
        /// Error message
        message: String,
        /// Whether retrying the same call may succeed
        transient: bool,
    },
}

impl ListingError {
    /// Returns the namespace the failed call was issued against.
    pub fn namespace(&self) -> &str {
        match self {
            Self::Api { namespace, .. } | Self::Other { namespace, .. } => namespace,
        }
    }

    /// Reports whether the failure is worth retrying.
    ///
    /// Throttling, server-side errors and transport failures are transient.
    /// Authorization failures, missing resources and malformed requests are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { source, .. } => match source {
                kube::Error::Api(response) => response.code == 429 || response.code >= 500,
                kube::Error::HyperError(_) | kube::Error::Service(_) => true,
                _ => false,
            },
            Self::Other { transient, .. } => *transient,
        }
    }
}

/// Error type for a scrape pass that could not complete.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Listing secrets failed for one of the configured namespaces
    #[error(transparent)]
    Listing(#[from] ListingError),

    /// The per-scrape gauge vectors could not be built
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The scrape did not finish within the configured deadline
    #[error("Scrape timed out after {after:?}")]
    Timeout {
        /// The deadline that was exceeded
        after: Duration,
    },
}
