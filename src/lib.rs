//! Certificate-expiry exporter for certificates stored in Kubernetes secrets.
//!
//! Every scrape lists the secrets of the configured namespaces, tries to read
//! each secret value as a PEM-encoded X.509 certificate and publishes the
//! validity window of every certificate found as a pair of gauges labeled by
//! the certificate subject.

use openssl::asn1::{Asn1StringRef, Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509};

pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod scraper;
pub mod server;
pub mod source;

pub use error::{ListingError, ParseError, ScrapeError};

const SECONDS_PER_DAY: i64 = 86_400;
const PEM_BEGIN: &[u8] = b"-----BEGIN ";

/// Subject fields and validity window extracted from one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    /// Subject common name, empty when absent
    pub common_name: String,
    /// Subject organizations joined with `,`
    pub organization: String,
    /// Subject organizational units joined with `,`
    pub organizational_unit: String,
    /// notBefore as seconds since the Unix epoch
    pub not_before: i64,
    /// notAfter as seconds since the Unix epoch
    pub not_after: i64,
}

/// Label values identifying a certificate time series.
///
/// Two certificates with the same subject fields share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleLabelKey {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
}

impl SampleLabelKey {
    /// Label values in `cn`, `o`, `ou` order.
    pub fn values(&self) -> [&str; 3] {
        [
            &self.common_name,
            &self.organization,
            &self.organizational_unit,
        ]
    }
}

impl ParsedCertificate {
    /// Decodes the first well-formed PEM block of `raw` and parses it as an X.509
    /// certificate.
    ///
    /// Bytes before the block are ignored, as are blocks that fail to decode.
    ///
    /// # Errors
    ///
    /// * `ParseError::InvalidPem` - no PEM block could be decoded
    /// * `ParseError::InvalidCertificate` - the block is not a DER certificate
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use certexporter::ParsedCertificate;
    /// let pem = std::fs::read("tls.crt")?;
    /// let cert = ParsedCertificate::from_pem(&pem)?;
    /// println!("{} expires at {}", cert.common_name, cert.not_after);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_pem(raw: &[u8]) -> Result<ParsedCertificate, ParseError> {
        let der = decode_pem(raw)?;
        let cert = X509::from_der(&der).map_err(|e| ParseError::InvalidCertificate {
            reason: e.to_string(),
        })?;
        get_certificate_info(&cert)
    }

    pub fn label_key(&self) -> SampleLabelKey {
        SampleLabelKey {
            common_name: self.common_name.clone(),
            organization: self.organization.clone(),
            organizational_unit: self.organizational_unit.clone(),
        }
    }
}

/// Shorthand for [`ParsedCertificate::from_pem`].
pub fn parse(raw: &[u8]) -> Result<ParsedCertificate, ParseError> {
    ParsedCertificate::from_pem(raw)
}

fn decode_pem(raw: &[u8]) -> Result<Vec<u8>, ParseError> {
    pem_block_starts(raw)
        .find_map(|start| x509_parser::pem::parse_x509_pem(&raw[start..]).ok())
        .map(|(_, pem)| pem.contents)
        .ok_or(ParseError::InvalidPem)
}

/// Offsets of every `-----BEGIN ` marker that opens a line.
fn pem_block_starts(raw: &[u8]) -> impl Iterator<Item = usize> + '_ {
    (0..raw.len()).filter(move |&i| {
        (i == 0 || raw[i - 1] == b'\n') && raw[i..].starts_with(PEM_BEGIN)
    })
}

fn get_certificate_info(cert_ref: &X509) -> Result<ParsedCertificate, ParseError> {
    let subject = cert_ref.subject_name();
    // Repeated CN attributes resolve to the last one.
    let common_name = name_entries(subject, Nid::COMMONNAME)
        .pop()
        .unwrap_or_default();

    Ok(ParsedCertificate {
        common_name,
        organization: name_entries(subject, Nid::ORGANIZATIONNAME).join(","),
        organizational_unit: name_entries(subject, Nid::ORGANIZATIONALUNITNAME).join(","),
        not_before: epoch_seconds(cert_ref.not_before())?,
        not_after: epoch_seconds(cert_ref.not_after())?,
    })
}

fn name_entries(name: &X509NameRef, nid: Nid) -> Vec<String> {
    name.entries_by_nid(nid)
        .map(|entry| entry_to_string(entry.data()))
        .collect()
}

fn entry_to_string(data: &Asn1StringRef) -> String {
    match data.as_utf8() {
        Ok(value) => value.to_string(),
        Err(_) => String::from_utf8_lossy(data.as_slice()).into_owned(),
    }
}

fn epoch_seconds(time: &Asn1TimeRef) -> Result<i64, ParseError> {
    let to_error = |e: openssl::error::ErrorStack| ParseError::InvalidCertificate {
        reason: e.to_string(),
    };
    let epoch = Asn1Time::from_unix(0).map_err(to_error)?;
    let diff = epoch.diff(time).map_err(to_error)?;
    Ok(i64::from(diff.days) * SECONDS_PER_DAY + i64::from(diff.secs))
}
