//! Counters and histograms for the site metrics pipeline
//!
//! Recorded through the `metrics` facade. No exporter is installed by this
//! crate; an embedding application can install whichever recorder it wants.

use std::fmt;

use crate::types::{DegradationKind, SourceKind};

/// All metric names used in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Build
    BuildRuns,
    BuildDuration,
    CacheHits,
    CacheMisses,
    CacheWriteErrors,

    // Ingestion
    SourceRowsRead,
    Degradations,

    // Scoring
    SitesScored,
    AnomaliesFlagged,
    InsufficientData,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::BuildRuns => "site_risk_build_runs_total",
            MetricName::BuildDuration => "site_risk_build_duration_seconds",
            MetricName::CacheHits => "site_risk_cache_hits_total",
            MetricName::CacheMisses => "site_risk_cache_misses_total",
            MetricName::CacheWriteErrors => "site_risk_cache_write_errors_total",
            MetricName::SourceRowsRead => "site_risk_source_rows_read_total",
            MetricName::Degradations => "site_risk_degradations_total",
            MetricName::SitesScored => "site_risk_sites_scored_total",
            MetricName::AnomaliesFlagged => "site_risk_anomalies_flagged_total",
            MetricName::InsufficientData => "site_risk_insufficient_data_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub mod build {
    use super::MetricName;

    pub fn run_started() {
        ::metrics::counter!(MetricName::BuildRuns.as_str()).increment(1);
    }

    pub fn duration(secs: f64) {
        ::metrics::histogram!(MetricName::BuildDuration.as_str()).record(secs);
    }

    pub fn cache_hit() {
        ::metrics::counter!(MetricName::CacheHits.as_str()).increment(1);
    }

    pub fn cache_miss() {
        ::metrics::counter!(MetricName::CacheMisses.as_str()).increment(1);
    }

    pub fn cache_write_error() {
        ::metrics::counter!(MetricName::CacheWriteErrors.as_str()).increment(1);
    }
}

pub mod ingestion {
    use super::{DegradationKind, MetricName, SourceKind};

    pub fn rows_read(source: SourceKind, rows: usize) {
        ::metrics::counter!(MetricName::SourceRowsRead.as_str(), "source" => source.as_str())
            .increment(rows as u64);
    }

    pub fn degradation(kind: DegradationKind, source: SourceKind) {
        ::metrics::counter!(
            MetricName::Degradations.as_str(),
            "kind" => kind.to_string(),
            "source" => source.as_str()
        )
        .increment(1);
    }
}

pub mod scoring {
    use super::MetricName;

    pub fn scored(sites: usize, anomalies: usize) {
        ::metrics::counter!(MetricName::SitesScored.as_str()).increment(sites as u64);
        ::metrics::counter!(MetricName::AnomaliesFlagged.as_str()).increment(anomalies as u64);
    }

    pub fn insufficient_data() {
        ::metrics::counter!(MetricName::InsufficientData.as_str()).increment(1);
    }
}
