use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_COUNTRY, DEFAULT_REGION, MISSING_PAGE_COUNT_COLUMN, QUERY_COUNT_COLUMN,
    SAE_COUNT_COLUMN,
};

// ---------------------------------------------------------------------------
// Source kinds
// ---------------------------------------------------------------------------

/// The three logical sources a study folder is expected to provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Per-query EDC metrics export; the only source of site metadata
    Ledger,
    /// Missing pages report
    MissingPages,
    /// Serious adverse event (SAE) dashboard
    AdverseEvents,
}

impl SourceKind {
    /// Fixed positional order used by the ingestion join
    pub const ALL: [SourceKind; 3] = [
        SourceKind::Ledger,
        SourceKind::MissingPages,
        SourceKind::AdverseEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Ledger => "ledger",
            SourceKind::MissingPages => "missing_pages",
            SourceKind::AdverseEvents => "adverse_events",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Raw tables
// ---------------------------------------------------------------------------

/// One row of a source after column selection and renaming.
///
/// Only the ledger carries country and region; the secondary sources only
/// populate `site_id`. Blank cells are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTableRow {
    pub site_id: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
}

impl RawTableRow {
    pub fn site(site_id: &str) -> Self {
        Self {
            site_id: Some(site_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_metadata(site_id: &str, country: &str, region: &str) -> Self {
        Self {
            site_id: Some(site_id.to_string()),
            country: Some(country.to_string()),
            region: Some(region.to_string()),
        }
    }
}

/// A normalized source table; empty when the source is absent or unreadable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub kind: SourceKind,
    pub file: Option<PathBuf>,
    pub rows: Vec<RawTableRow>,
}

impl RawTable {
    pub fn empty(kind: SourceKind) -> Self {
        Self {
            kind,
            file: None,
            rows: Vec::new(),
        }
    }

    pub fn new(kind: SourceKind, rows: Vec<RawTableRow>) -> Self {
        Self {
            kind,
            file: None,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

// ---------------------------------------------------------------------------
// Canonical table
// ---------------------------------------------------------------------------

/// Site identity and location; country/region are always populated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteMetadata {
    pub site_id: String,
    pub country: String,
    pub region: String,
}

impl SiteMetadata {
    pub fn unknown(site_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            country: DEFAULT_COUNTRY.to_string(),
            region: DEFAULT_REGION.to_string(),
        }
    }
}

/// One harmonized row of the canonical per-site table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteMetricsRow {
    // Renames must match SITE_ID_COLUMN, COUNTRY_COLUMN and REGION_COLUMN
    #[serde(rename = "Site ID")]
    pub site_id: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(rename = "Region")]
    pub region: String,
    pub query_count: u64,
    pub missing_page_count: u64,
    pub sae_count: u64,
}

impl SiteMetricsRow {
    pub fn from_metadata(metadata: SiteMetadata) -> Self {
        Self {
            site_id: metadata.site_id,
            country: metadata.country,
            region: metadata.region,
            query_count: 0,
            missing_page_count: 0,
            sae_count: 0,
        }
    }

    /// Look up a numeric feature by its canonical column name
    pub fn feature(&self, column: &str) -> Option<f64> {
        match column {
            QUERY_COUNT_COLUMN => Some(self.query_count as f64),
            MISSING_PAGE_COUNT_COLUMN => Some(self.missing_page_count as f64),
            SAE_COUNT_COLUMN => Some(self.sae_count as f64),
            _ => None,
        }
    }
}

/// The canonical site metrics table, one row per distinct Site ID, ordered by Site ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalSiteMetrics {
    rows: Vec<SiteMetricsRow>,
}

impl CanonicalSiteMetrics {
    pub fn new(mut rows: Vec<SiteMetricsRow>) -> Self {
        rows.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[SiteMetricsRow] {
        &self.rows
    }

    pub fn get(&self, site_id: &str) -> Option<&SiteMetricsRow> {
        self.rows.iter().find(|r| r.site_id == site_id)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

// ---------------------------------------------------------------------------
// Scored table
// ---------------------------------------------------------------------------

/// Discrete outlier decision for a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyLabel {
    Anomalous,
    Normal,
}

impl AnomalyLabel {
    pub fn is_anomalous(&self) -> bool {
        matches!(self, AnomalyLabel::Anomalous)
    }
}

impl fmt::Display for AnomalyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyLabel::Anomalous => write!(f, "anomalous"),
            AnomalyLabel::Normal => write!(f, "normal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSiteRow {
    #[serde(flatten)]
    pub metrics: SiteMetricsRow,
    /// Lower (more negative) is more anomalous
    pub anomaly_score: f64,
    pub is_anomaly: AnomalyLabel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoredSiteMetrics {
    rows: Vec<ScoredSiteRow>,
}

impl ScoredSiteMetrics {
    pub fn new(rows: Vec<ScoredSiteRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[ScoredSiteRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, site_id: &str) -> Option<&ScoredSiteRow> {
        self.rows.iter().find(|r| r.metrics.site_id == site_id)
    }

    /// Anomalous rows, most anomalous first
    pub fn anomalies(&self) -> Vec<&ScoredSiteRow> {
        let mut flagged: Vec<&ScoredSiteRow> = self
            .rows
            .iter()
            .filter(|r| r.is_anomaly.is_anomalous())
            .collect();
        flagged.sort_by(|a, b| a.anomaly_score.total_cmp(&b.anomaly_score));
        flagged
    }
}

// ---------------------------------------------------------------------------
// Degradations
// ---------------------------------------------------------------------------

/// Recovered failure classes; none of them aborts a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    /// Expected file or directory is missing
    SourceUnavailable,
    /// No alias or synonym matched a required header
    ColumnUnresolved,
    /// File present but unreadable, corrupt, panicked or timed out
    ReadFailure,
}

impl fmt::Display for DegradationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradationKind::SourceUnavailable => write!(f, "SOURCE_UNAVAILABLE"),
            DegradationKind::ColumnUnresolved => write!(f, "COLUMN_UNRESOLVED"),
            DegradationKind::ReadFailure => write!(f, "READ_FAILURE"),
        }
    }
}

/// A degradation as recorded in the build report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degradation {
    pub kind: DegradationKind,
    pub source: SourceKind,
    pub file: Option<String>,
    pub reason: String,
}

impl Degradation {
    pub fn new(kind: DegradationKind, source: SourceKind, file: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            source,
            file,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "[{}] {} ({}): {}", self.kind, self.source, file, self.reason),
            None => write!(f, "[{}] {}: {}", self.kind, self.source, self.reason),
        }
    }
}
