//! Metrics collection and export module.
//!
//! This module turns scrape results into Prometheus metric families and
//! renders them in the text exposition format.
//!
//! # Submodules
//!
//! - `prom` - metric schema and the per-request certificate collector

pub mod prom;

pub use prom::{render, CertificateCollector, MetricSchema, LABELS};
