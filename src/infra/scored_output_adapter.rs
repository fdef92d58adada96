use crate::app::ports::MetricsOutputPort;
use crate::constants::study_slug;
use crate::types::{CanonicalSiteMetrics, ScoredSiteMetrics};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// File-based implementation of MetricsOutputPort
/// Writes each study's tables as pretty JSON under one output directory
pub struct FileMetricsOutputAdapter {
    output_dir: PathBuf,
}

impl FileMetricsOutputAdapter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn site_metrics_path(&self, study: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_site_metrics.json", study_slug(study)))
    }

    pub fn scored_site_metrics_path(&self, study: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_scored_site_metrics.json", study_slug(study)))
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> anyhow::Result<String> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, json).await?;
        let path = path.display().to_string();
        info!("Wrote {}", path);
        Ok(path)
    }
}

#[async_trait::async_trait]
impl MetricsOutputPort for FileMetricsOutputAdapter {
    async fn write_site_metrics(&self, study: &str, table: &CanonicalSiteMetrics) -> anyhow::Result<String> {
        let path = self.site_metrics_path(study);
        self.write_json(&path, table).await
    }

    async fn write_scored_site_metrics(&self, study: &str, scored: &ScoredSiteMetrics) -> anyhow::Result<String> {
        let path = self.scored_site_metrics_path(study);
        self.write_json(&path, scored).await
    }
}
