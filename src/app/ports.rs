use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::types::{CanonicalSiteMetrics, ScoredSiteMetrics};

/// Read access to the first worksheet of a workbook.
///
/// Kept behind a trait so source selection, column resolution and renaming
/// can be exercised without workbooks on disk.
pub trait WorkbookReader: Send + Sync {
    /// The header row, one string per column (blank headers are empty strings)
    fn read_header(&self, path: &Path) -> Result<Vec<String>>;

    /// Data rows below the header restricted to `columns`, in the requested order.
    /// Blank cells are `None`.
    fn read_columns(&self, path: &Path, columns: &[usize]) -> Result<Vec<Vec<Option<String>>>>;
}

/// Destination for the persisted per-study artifacts
#[async_trait]
pub trait MetricsOutputPort: Send + Sync {
    /// Persist the canonical table; returns where it was written
    async fn write_site_metrics(&self, study: &str, table: &CanonicalSiteMetrics) -> anyhow::Result<String>;

    /// Persist the scored table; returns where it was written
    async fn write_scored_site_metrics(&self, study: &str, scored: &ScoredSiteMetrics) -> anyhow::Result<String>;
}
