use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tracing::{info, instrument};

use super::source_reader::{file_name, read_source, record_degradation, SourceReadOutcome, SourceSelection, SourceSpec};
use crate::app::ports::WorkbookReader;
use crate::constants::{ABANDONED_READ_GRACE_MS, DEFAULT_MAX_WORKERS, DEFAULT_READ_TIMEOUT_SECS};
use crate::types::{Degradation, DegradationKind, RawTable, SourceKind};

/// Worker pool width and per-read deadline for the ingestion phase
#[derive(Debug, Clone)]
pub struct IngestionSettings {
    pub max_workers: usize,
    pub read_timeout: Duration,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        }
    }
}

/// The three source tables in fixed positional order
#[derive(Debug, Clone)]
pub struct IngestedSources {
    pub ledger: RawTable,
    pub missing_pages: RawTable,
    pub adverse_events: RawTable,
    pub degradations: Vec<Degradation>,
}

/// Read all three sources concurrently and join them.
///
/// The result does not depend on completion order. Panics and deadline
/// expiries inside a read become an empty table for that source; nothing
/// propagates past this function.
///
/// A read that misses its deadline is abandoned, not cancelled: its blocking
/// thread runs to completion and keeps its worker permit until then. Shut the
/// runtime down with [`shutdown_runtime`] so an abandoned read cannot hold the
/// process open.
#[instrument(skip_all, fields(max_workers = settings.max_workers))]
pub async fn ingest_sources(
    reader: Arc<dyn WorkbookReader>,
    selection: &SourceSelection,
    settings: &IngestionSettings,
) -> IngestedSources {
    let permits = Arc::new(Semaphore::new(settings.max_workers.max(1)));
    let read = |kind: SourceKind| {
        read_bounded(
            reader.clone(),
            permits.clone(),
            kind,
            selection.get(kind).cloned(),
            settings.read_timeout,
        )
    };

    let (ledger, missing_pages, adverse_events) = tokio::join!(
        read(SourceKind::Ledger),
        read(SourceKind::MissingPages),
        read(SourceKind::AdverseEvents),
    );

    let mut degradations = Vec::new();
    for outcome in [&ledger, &missing_pages, &adverse_events] {
        degradations.extend(outcome.degradations.iter().cloned());
    }

    info!(
        ledger_rows = ledger.table.len(),
        missing_page_rows = missing_pages.table.len(),
        sae_rows = adverse_events.table.len(),
        degradations = degradations.len(),
        "Ingestion joined"
    );

    IngestedSources {
        ledger: ledger.table,
        missing_pages: missing_pages.table,
        adverse_events: adverse_events.table,
        degradations,
    }
}

async fn read_bounded(
    reader: Arc<dyn WorkbookReader>,
    permits: Arc<Semaphore>,
    kind: SourceKind,
    path: Option<PathBuf>,
    deadline: Duration,
) -> SourceReadOutcome {
    let file = path.as_deref().map(file_name);
    let fail = |reason: String| {
        let degradation = Degradation::new(DegradationKind::ReadFailure, kind, file.clone(), reason);
        record_degradation(&degradation);
        SourceReadOutcome::degraded(kind, degradation)
    };

    let spec = SourceSpec::for_kind(kind);
    let work = async move {
        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| "worker pool closed".to_string())?;
        tokio::task::spawn_blocking(move || {
            // Held until the read returns, even after the caller stops waiting
            let _permit = permit;
            read_source(reader.as_ref(), spec, path.as_deref())
        })
        .await
        .map_err(|join_err| format!("reader task failed: {}", join_err))
    };

    // The deadline covers waiting for a worker as well as the read itself
    match tokio::time::timeout(deadline, work).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(reason)) => fail(reason),
        Err(_) => fail(format!("read timed out after {:?}", deadline)),
    }
}

/// Shut down a runtime without joining reads abandoned after their deadline
pub fn shutdown_runtime(runtime: Runtime) {
    runtime.shutdown_timeout(Duration::from_millis(ABANDONED_READ_GRACE_MS));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::pipeline::ingestion::source_reader::test_support::FakeWorkbookReader;
    use crate::types::RawTableRow;
    use std::path::Path;
    use std::time::Instant;

    fn selection() -> SourceSelection {
        SourceSelection {
            ledger: Some(PathBuf::from("/study/EDC_Metrics.xlsx")),
            missing_pages: Some(PathBuf::from("/study/Missing_Pages.xlsx")),
            adverse_events: Some(PathBuf::from("/study/SAE_Dashboard.xlsx")),
        }
    }

    fn fake_study() -> FakeWorkbookReader {
        FakeWorkbookReader::default()
            .with_sheet("EDC_Metrics.xlsx", &["Site ID", "Country", "Region"], &[&["Site-1", "US", "West"]])
            .with_sheet("Missing_Pages.xlsx", &["Site number"], &[&["Site-2"], &["Site-2"]])
            .with_sheet("SAE_Dashboard.xlsx", &["Site No"], &[&["Site-3"]])
    }

    /// Delegates to a fake, but misbehaves for one file
    struct FaultyReader {
        inner: FakeWorkbookReader,
        faulty_file: &'static str,
        stall: Option<Duration>,
    }

    impl WorkbookReader for FaultyReader {
        fn read_header(&self, path: &Path) -> Result<Vec<String>> {
            if path.ends_with(self.faulty_file) {
                match self.stall {
                    Some(d) => std::thread::sleep(d),
                    None => panic!("corrupt shared strings table"),
                }
            }
            self.inner.read_header(path)
        }

        fn read_columns(&self, path: &Path, columns: &[usize]) -> Result<Vec<Vec<Option<String>>>> {
            self.inner.read_columns(path, columns)
        }
    }

    #[tokio::test]
    async fn test_results_are_in_fixed_positional_order() {
        let reader: Arc<dyn WorkbookReader> = Arc::new(fake_study());
        let sources = ingest_sources(reader, &selection(), &IngestionSettings::default()).await;

        assert_eq!(sources.ledger.kind, SourceKind::Ledger);
        assert_eq!(sources.ledger.rows, vec![RawTableRow::with_metadata("Site-1", "US", "West")]);
        assert_eq!(sources.missing_pages.kind, SourceKind::MissingPages);
        assert_eq!(sources.missing_pages.len(), 2);
        assert_eq!(sources.adverse_events.kind, SourceKind::AdverseEvents);
        assert_eq!(sources.adverse_events.rows, vec![RawTableRow::site("Site-3")]);
        assert!(sources.degradations.is_empty());
    }

    #[tokio::test]
    async fn test_single_worker_still_reads_everything() {
        let reader: Arc<dyn WorkbookReader> = Arc::new(fake_study());
        let settings = IngestionSettings {
            max_workers: 1,
            ..IngestionSettings::default()
        };
        let sources = ingest_sources(reader, &selection(), &settings).await;
        assert_eq!(sources.ledger.len() + sources.missing_pages.len() + sources.adverse_events.len(), 4);
    }

    #[tokio::test]
    async fn test_panicking_reader_degrades_only_its_source() {
        let reader: Arc<dyn WorkbookReader> = Arc::new(FaultyReader {
            inner: fake_study(),
            faulty_file: "Missing_Pages.xlsx",
            stall: None,
        });
        let sources = ingest_sources(reader, &selection(), &IngestionSettings::default()).await;

        assert!(sources.missing_pages.is_empty());
        assert_eq!(sources.ledger.len(), 1);
        assert_eq!(sources.adverse_events.len(), 1);
        assert_eq!(sources.degradations.len(), 1);
        assert_eq!(sources.degradations[0].kind, DegradationKind::ReadFailure);
        assert_eq!(sources.degradations[0].source, SourceKind::MissingPages);
        assert_eq!(sources.degradations[0].file.as_deref(), Some("Missing_Pages.xlsx"));
    }

    #[tokio::test]
    async fn test_stalled_read_hits_deadline() {
        let reader: Arc<dyn WorkbookReader> = Arc::new(FaultyReader {
            inner: fake_study(),
            faulty_file: "SAE_Dashboard.xlsx",
            stall: Some(Duration::from_millis(400)),
        });
        let settings = IngestionSettings {
            max_workers: 3,
            read_timeout: Duration::from_millis(50),
        };
        let sources = ingest_sources(reader, &selection(), &settings).await;

        assert!(sources.adverse_events.is_empty());
        assert_eq!(sources.ledger.len(), 1);
        assert!(sources.degradations[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_stalled_read_keeps_its_worker() {
        let reader: Arc<dyn WorkbookReader> = Arc::new(FaultyReader {
            inner: fake_study(),
            faulty_file: "EDC_Metrics.xlsx",
            stall: Some(Duration::from_millis(400)),
        });
        let settings = IngestionSettings {
            max_workers: 1,
            read_timeout: Duration::from_millis(50),
        };
        let sources = ingest_sources(reader, &selection(), &settings).await;

        // The single worker stays busy with the stalled ledger read, so the
        // other two sources never start before their own deadlines
        assert_eq!(sources.degradations.len(), 3);
        assert!(sources
            .degradations
            .iter()
            .all(|d| d.kind == DegradationKind::ReadFailure && d.reason.contains("timed out")));
    }

    #[test]
    fn test_runtime_shutdown_does_not_join_abandoned_reads() {
        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
        let reader: Arc<dyn WorkbookReader> = Arc::new(FaultyReader {
            inner: fake_study(),
            faulty_file: "SAE_Dashboard.xlsx",
            stall: Some(Duration::from_secs(5)),
        });
        let settings = IngestionSettings {
            max_workers: 3,
            read_timeout: Duration::from_millis(100),
        };

        let sources = runtime.block_on(ingest_sources(reader, &selection(), &settings));
        assert_eq!(sources.ledger.len(), 1);
        assert_eq!(sources.degradations.len(), 1);
        assert!(sources.degradations[0].reason.contains("timed out"));

        let started = Instant::now();
        shutdown_runtime(runtime);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_missing_selection_is_source_unavailable() {
        let reader: Arc<dyn WorkbookReader> = Arc::new(fake_study());
        let selection = SourceSelection {
            ledger: Some(PathBuf::from("/study/EDC_Metrics.xlsx")),
            ..SourceSelection::default()
        };
        let sources = ingest_sources(reader, &selection, &IngestionSettings::default()).await;

        assert_eq!(sources.ledger.len(), 1);
        let kinds: Vec<_> = sources.degradations.iter().map(|d| (d.source, d.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (SourceKind::MissingPages, DegradationKind::SourceUnavailable),
                (SourceKind::AdverseEvents, DegradationKind::SourceUnavailable),
            ]
        );
    }
}
