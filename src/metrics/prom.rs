//! Certificate gauges and their async collector.
//!
//! The collector is not registered with a `prometheus::Registry`; the `/metrics`
//! handler merges its families with the registry's own output on each request.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, TextEncoder};
use std::collections::HashMap;
use tracing::instrument;

use crate::error::ScrapeError;
use crate::scraper::Scraper;
use crate::source::SecretSource;

/// Label names of both gauges, in label value order.
pub const LABELS: [&str; 3] = ["cn", "o", "ou"];

const NOT_AFTER_NAME: &str = "cert_not_after";
const NOT_AFTER_HELP: &str = "cert notAfter expressed as a Unix Epoch Time";
const NOT_BEFORE_NAME: &str = "cert_not_before";
const NOT_BEFORE_HELP: &str = "cert notBefore expressed as a Unix Epoch Time";

/// Names, help texts and labels of the exported gauges.
///
/// Built once at startup from the configured metric namespace.
#[derive(Debug)]
pub struct MetricSchema {
    not_after: Opts,
    not_before: Opts,
    descs: Vec<Desc>,
}

impl MetricSchema {
    /// Builds the schema for `<namespace>_cert_not_after` and `<namespace>_cert_not_before`.
    ///
    /// Fails when the namespace does not form a valid metric name.
    pub fn new(namespace: &str) -> Result<MetricSchema, prometheus::Error> {
        let not_after = Opts::new(NOT_AFTER_NAME, NOT_AFTER_HELP).namespace(namespace);
        let not_before = Opts::new(NOT_BEFORE_NAME, NOT_BEFORE_HELP).namespace(namespace);
        let descs = vec![describe_opts(&not_after)?, describe_opts(&not_before)?];
        Ok(MetricSchema {
            not_after,
            not_before,
            descs,
        })
    }

    /// Creates a fresh, empty pair of gauge vectors (notAfter, notBefore).
    pub fn gauge_vecs(&self) -> Result<(GaugeVec, GaugeVec), prometheus::Error> {
        Ok((
            GaugeVec::new(self.not_after.clone(), &LABELS)?,
            GaugeVec::new(self.not_before.clone(), &LABELS)?,
        ))
    }

    pub fn descs(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }
}

fn describe_opts(opts: &Opts) -> Result<Desc, prometheus::Error> {
    Desc::new(
        opts.fq_name(),
        opts.help.clone(),
        LABELS.iter().map(|label| label.to_string()).collect(),
        HashMap::new(),
    )
}

/// Pull-based collector for certificate validity gauges.
///
/// Every call to [`collect`](CertificateCollector::collect) runs a full scrape
/// into gauge vectors owned by that call, so concurrent requests never share
/// samples and a failed scrape leaves nothing behind.
pub struct CertificateCollector<S: ?Sized> {
    schema: MetricSchema,
    scraper: Scraper<S>,
}

impl<S: SecretSource + ?Sized> CertificateCollector<S> {
    pub fn new(schema: MetricSchema, scraper: Scraper<S>) -> Self {
        CertificateCollector { schema, scraper }
    }

    /// Descriptors of the notAfter and notBefore gauges.
    pub fn describe(&self) -> Vec<&Desc> {
        self.schema.descs()
    }

    /// Scrapes the cluster and returns the resulting metric families.
    ///
    /// Families without samples are left out.
    #[instrument(skip_all, name = "certexporter.collect")]
    pub async fn collect(&self) -> Result<Vec<MetricFamily>, ScrapeError> {
        let (not_after, not_before) = self.schema.gauge_vecs()?;
        let stats = self.scraper.scrape(&not_after, &not_before).await?;
        if stats.certificates == 0 {
            return Ok(Vec::new());
        }

        let mut families = not_after.collect();
        families.extend(not_before.collect());
        Ok(families)
    }
}

/// Renders metric families in the Prometheus text exposition format.
pub fn render(families: &[MetricFamily]) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
