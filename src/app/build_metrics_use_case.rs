use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::app::ports::WorkbookReader;
use crate::error::Result;
use crate::observability::metrics;
use crate::pipeline::ingestion::source_reader::{
    keyword_score, list_spreadsheets, record_degradation, FileRanker, SourceSelection,
};
use crate::pipeline::ingestion::{ingest_sources, IngestionSettings};
use crate::pipeline::processing::aggregate::aggregate;
use crate::pipeline::storage::{CacheKey, InvalidationPolicy, MetricsCache};
use crate::types::{CanonicalSiteMetrics, Degradation, DegradationKind, SourceKind};

/// Outcome of one build of a study's canonical table
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub run_id: Uuid,
    pub study: String,
    pub table: CanonicalSiteMetrics,
    pub cache_hit: bool,
    pub degradations: Vec<Degradation>,
}

impl BuildReport {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

/// Use case for building (or loading from cache) the canonical site metrics of a study
pub struct BuildMetricsUseCase {
    study_root: PathBuf,
    reader: Arc<dyn WorkbookReader>,
    cache: Arc<dyn MetricsCache>,
    settings: IngestionSettings,
    invalidation: InvalidationPolicy,
    ranker: FileRanker,
}

impl BuildMetricsUseCase {
    pub fn new<P: AsRef<Path>>(
        study_root: P,
        reader: Arc<dyn WorkbookReader>,
        cache: Arc<dyn MetricsCache>,
    ) -> Self {
        Self {
            study_root: study_root.as_ref().to_path_buf(),
            reader,
            cache,
            settings: IngestionSettings::default(),
            invalidation: InvalidationPolicy::default(),
            ranker: keyword_score,
        }
    }

    pub fn with_settings(mut self, settings: IngestionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_invalidation(mut self, invalidation: InvalidationPolicy) -> Self {
        self.invalidation = invalidation;
        self
    }

    /// Replace the filename ranking used to pick each source's file
    pub fn with_ranker(mut self, ranker: FileRanker) -> Self {
        self.ranker = ranker;
        self
    }

    pub fn study_root(&self) -> &Path {
        &self.study_root
    }

    /// The canonical table for `study`; degradations are logged but not returned
    pub async fn build_site_metrics(&self, study: &str) -> CanonicalSiteMetrics {
        self.build(study).await.table
    }

    #[instrument(skip(self))]
    pub async fn build(&self, study: &str) -> BuildReport {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        metrics::build::run_started();
        info!(%run_id, "Building site metrics");

        let report = self.build_inner(run_id, study).await;

        let elapsed = started.elapsed();
        metrics::build::duration(elapsed.as_secs_f64());
        info!(
            %run_id,
            sites = report.table.len(),
            cache_hit = report.cache_hit,
            degradations = report.degradations.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Build finished"
        );
        report
    }

    async fn build_inner(&self, run_id: Uuid, study: &str) -> BuildReport {
        let mut report = BuildReport {
            run_id,
            study: study.to_string(),
            table: CanonicalSiteMetrics::empty(),
            cache_hit: false,
            degradations: Vec::new(),
        };

        let study_dir = self.study_root.join(study);
        let files = match list_spreadsheets(&study_dir) {
            Ok(files) => files,
            Err(e) => {
                let degradation = Degradation::new(
                    DegradationKind::SourceUnavailable,
                    SourceKind::Ledger,
                    None,
                    format!("study directory {} unreadable: {}", study_dir.display(), e),
                );
                record_degradation(&degradation);
                report.degradations.push(degradation);
                return report;
            }
        };
        debug!(files = files.len(), "Listed study spreadsheets");

        let key = self.cache_key(study, &files);
        if let Some(key) = &key {
            match self.cache.get(key) {
                Ok(Some(table)) => {
                    metrics::build::cache_hit();
                    info!(sites = table.len(), "Loaded site metrics from cache");
                    report.table = table;
                    report.cache_hit = true;
                    return report;
                }
                Ok(None) => metrics::build::cache_miss(),
                Err(e) => {
                    metrics::build::cache_miss();
                    warn!(error = %e, "Cache read failed; rebuilding");
                }
            }
        }

        let selection = SourceSelection::select(&files, self.ranker);
        let sources = ingest_sources(self.reader.clone(), &selection, &self.settings).await;
        report.degradations = sources.degradations;
        report.table = aggregate(&sources.ledger, &sources.missing_pages, &sources.adverse_events);

        match &key {
            Some(key) if !report.table.is_empty() => {
                if let Err(e) = self.cache.put(key, &report.table) {
                    metrics::build::cache_write_error();
                    warn!(error = %e, "Cache write failed; table not cached");
                }
            }
            _ => debug!("Nothing to cache"),
        }

        report
    }

    fn cache_key(&self, study: &str, files: &[PathBuf]) -> Option<CacheKey> {
        if files.is_empty() {
            return None;
        }
        match CacheKey::from_files(study, files, self.invalidation) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "Could not stamp source files; cache bypassed");
                None
            }
        }
    }
}

/// Study folders under `study_root`, sorted by name; hidden folders are skipped
pub fn list_studies(study_root: &Path) -> Result<Vec<String>> {
    let mut studies = Vec::new();
    for entry in std::fs::read_dir(study_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') {
            studies.push(name);
        }
    }
    studies.sort();
    Ok(studies)
}
