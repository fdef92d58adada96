//! Per-study cache of the canonical site metrics table.
//!
//! One entry per study, overwritten on rebuild. Freshness is judged against
//! the study's current source files, either by modification time or by a
//! content fingerprint.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::source_reader::file_name;
use crate::types::CanonicalSiteMetrics;

/// How a cached table is judged stale
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPolicy {
    /// Stale once any source file is modified at or after the build time
    #[default]
    ModifiedTime,
    /// Stale once the SHA-256 over the source files' names and bytes changes
    ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStamp {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// Study identity plus the current state of its source files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub study: String,
    pub policy: InvalidationPolicy,
    pub sources: Vec<SourceStamp>,
    /// Only computed under [`InvalidationPolicy::ContentHash`]
    pub fingerprint: Option<String>,
}

impl CacheKey {
    pub fn from_files(study: &str, files: &[PathBuf], policy: InvalidationPolicy) -> Result<Self> {
        let mut sources = Vec::with_capacity(files.len());
        for path in files {
            let modified = std::fs::metadata(path)?.modified()?;
            sources.push(SourceStamp {
                path: path.clone(),
                modified: DateTime::<Utc>::from(modified),
            });
        }
        let fingerprint = match policy {
            InvalidationPolicy::ModifiedTime => None,
            InvalidationPolicy::ContentHash => Some(content_fingerprint(files)?),
        };
        Ok(Self {
            study: study.to_string(),
            policy,
            sources,
            fingerprint,
        })
    }

    pub fn newest_source(&self) -> Option<DateTime<Utc>> {
        self.sources.iter().map(|s| s.modified).max()
    }

    /// Whether `entry` still reflects the sources described by this key
    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        if entry.study != self.study {
            return false;
        }
        match self.policy {
            InvalidationPolicy::ModifiedTime => self.sources.iter().all(|s| entry.built_at > s.modified),
            InvalidationPolicy::ContentHash => {
                self.fingerprint.is_some() && entry.fingerprint == self.fingerprint
            }
        }
    }
}

/// SHA-256 over (file name, byte length, bytes) of every file, sorted by file name
pub fn content_fingerprint(files: &[PathBuf]) -> Result<String> {
    let mut named: Vec<(String, &PathBuf)> = files.iter().map(|p| (file_name(p), p)).collect();
    named.sort();

    let mut hasher = Sha256::new();
    for (name, path) in named {
        let bytes = std::fs::read(path)?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub study: String,
    pub built_at: DateTime<Utc>,
    pub fingerprint: Option<String>,
    pub snapshot: CanonicalSiteMetrics,
}

/// Storage for cached canonical tables.
///
/// Implementors provide raw entry storage; freshness checks live in the
/// provided methods so every store applies the same rules.
pub trait MetricsCache: Send + Sync {
    fn load(&self, study: &str) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite the entry for `entry.study`
    fn store(&self, entry: CacheEntry) -> Result<()>;

    /// Returns whether an entry existed
    fn remove(&self, study: &str) -> Result<bool>;

    /// Returns the number of entries dropped
    fn clear(&self) -> Result<usize>;

    fn get(&self, key: &CacheKey) -> Result<Option<CanonicalSiteMetrics>> {
        match self.load(&key.study)? {
            Some(entry) if key.is_fresh(&entry) => Ok(Some(entry.snapshot)),
            Some(entry) => {
                debug!(
                    study = %key.study,
                    built_at = %entry.built_at,
                    newest_source = ?key.newest_source(),
                    "Cached table is stale"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &CacheKey, table: &CanonicalSiteMetrics) -> Result<()> {
        self.put_at(key, table, Utc::now())
    }

    fn put_at(&self, key: &CacheKey, table: &CanonicalSiteMetrics, built_at: DateTime<Utc>) -> Result<()> {
        self.store(CacheEntry {
            study: key.study.clone(),
            built_at,
            fingerprint: key.fingerprint.clone(),
            snapshot: table.clone(),
        })
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> PipelineError {
    PipelineError::Cache("cache lock poisoned".to_string())
}

/// SQLite-backed cache, one row per study
pub struct SqliteMetricsCache {
    conn: Mutex<Connection>,
}

impl SqliteMetricsCache {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(db_path.as_ref())?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS site_metrics_cache (
                study        TEXT PRIMARY KEY,
                built_at_ms  INTEGER NOT NULL,
                fingerprint  TEXT,
                snapshot     TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl MetricsCache for SqliteMetricsCache {
    fn load(&self, study: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt =
            conn.prepare("SELECT built_at_ms, fingerprint, snapshot FROM site_metrics_cache WHERE study = ?1")?;
        let mut rows = stmt.query(params![study])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let built_at_ms: i64 = row.get(0)?;
        let fingerprint: Option<String> = row.get(1)?;
        let snapshot: String = row.get(2)?;
        let built_at = Utc
            .timestamp_millis_opt(built_at_ms)
            .single()
            .ok_or_else(|| PipelineError::Cache(format!("invalid build timestamp {} for {}", built_at_ms, study)))?;

        Ok(Some(CacheEntry {
            study: study.to_string(),
            built_at,
            fingerprint,
            snapshot: serde_json::from_str(&snapshot)?,
        }))
    }

    fn store(&self, entry: CacheEntry) -> Result<()> {
        let snapshot = serde_json::to_string(&entry.snapshot)?;
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT INTO site_metrics_cache (study, built_at_ms, fingerprint, snapshot) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(study) DO UPDATE SET built_at_ms=excluded.built_at_ms, fingerprint=excluded.fingerprint, snapshot=excluded.snapshot",
            params![entry.study, entry.built_at.timestamp_millis(), entry.fingerprint, snapshot],
        )?;
        Ok(())
    }

    fn remove(&self, study: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let n = conn.execute("DELETE FROM site_metrics_cache WHERE study = ?1", params![study])?;
        Ok(n > 0)
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let n = conn.execute("DELETE FROM site_metrics_cache", [])?;
        Ok(n)
    }
}

/// In-memory cache for tests and embedding
#[derive(Default)]
pub struct InMemoryMetricsCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryMetricsCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsCache for InMemoryMetricsCache {
    fn load(&self, study: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.lock().map_err(poisoned)?;
        Ok(entries.get(study).cloned())
    }

    fn store(&self, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.insert(entry.study.clone(), entry);
        Ok(())
    }

    fn remove(&self, study: &str) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        Ok(entries.remove(study).is_some())
    }

    fn clear(&self) -> Result<usize> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let n = entries.len();
        entries.clear();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SiteMetricsRow;
    use chrono::Duration;
    use tempfile::TempDir;

    fn table() -> CanonicalSiteMetrics {
        CanonicalSiteMetrics::new(vec![SiteMetricsRow {
            site_id: "Site-1".into(),
            country: "US".into(),
            region: "West".into(),
            query_count: 4,
            missing_page_count: 1,
            sae_count: 0,
        }])
    }

    fn built_at() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn key_with_sources(study: &str, modified: &[DateTime<Utc>]) -> CacheKey {
        CacheKey {
            study: study.to_string(),
            policy: InvalidationPolicy::ModifiedTime,
            sources: modified
                .iter()
                .enumerate()
                .map(|(i, m)| SourceStamp {
                    path: PathBuf::from(format!("/study/source_{}.xlsx", i)),
                    modified: *m,
                })
                .collect(),
            fingerprint: None,
        }
    }

    fn stores() -> Vec<Box<dyn MetricsCache>> {
        vec![
            Box::new(InMemoryMetricsCache::new()),
            Box::new(SqliteMetricsCache::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_source_modified_after_build_is_a_miss() {
        let t = built_at();
        for cache in stores() {
            cache.put_at(&key_with_sources("S1", &[]), &table(), t).unwrap();

            let newer = key_with_sources("S1", &[t - Duration::hours(2), t + Duration::seconds(1)]);
            assert_eq!(cache.get(&newer).unwrap(), None);

            let older = key_with_sources("S1", &[t - Duration::seconds(1), t - Duration::hours(2)]);
            assert_eq!(cache.get(&older).unwrap(), Some(table()));
        }
    }

    #[test]
    fn test_source_modified_at_build_time_is_a_miss() {
        let t = built_at();
        for cache in stores() {
            cache.put_at(&key_with_sources("S1", &[]), &table(), t).unwrap();
            assert_eq!(cache.get(&key_with_sources("S1", &[t])).unwrap(), None);
        }
    }

    #[test]
    fn test_entries_are_per_study_and_overwritten() {
        let t = built_at();
        for cache in stores() {
            let key = key_with_sources("S1", &[t - Duration::days(1)]);
            cache.put_at(&key, &CanonicalSiteMetrics::empty(), t).unwrap();
            cache.put_at(&key, &table(), t).unwrap();
            assert_eq!(cache.get(&key).unwrap(), Some(table()));
            assert_eq!(cache.get(&key_with_sources("S2", &[])).unwrap(), None);
        }
    }

    #[test]
    fn test_remove_and_clear() {
        let t = built_at();
        for cache in stores() {
            cache.put_at(&key_with_sources("S1", &[]), &table(), t).unwrap();
            cache.put_at(&key_with_sources("S2", &[]), &table(), t).unwrap();

            assert!(cache.remove("S1").unwrap());
            assert!(!cache.remove("S1").unwrap());
            assert!(cache.load("S1").unwrap().is_none());
            assert_eq!(cache.clear().unwrap(), 1);
            assert!(cache.load("S2").unwrap().is_none());
        }
    }

    #[test]
    fn test_sqlite_cache_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("cache").join("site_metrics.db");
        let key = key_with_sources("S1", &[built_at() - Duration::minutes(5)]);
        {
            let cache = SqliteMetricsCache::open(&db).unwrap();
            cache.put_at(&key, &table(), built_at()).unwrap();
        }
        let cache = SqliteMetricsCache::open(&db).unwrap();
        let entry = cache.load("S1").unwrap().unwrap();
        assert_eq!(entry.built_at, built_at());
        assert_eq!(cache.get(&key).unwrap(), Some(table()));
    }

    #[test]
    fn test_key_from_files_uses_file_mtimes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("EDC_Metrics.xlsx");
        std::fs::write(&file, b"v1").unwrap();

        let key = CacheKey::from_files("S1", &[file.clone()], InvalidationPolicy::ModifiedTime).unwrap();
        let mtime = key.newest_source().unwrap();
        assert_eq!(key.fingerprint, None);

        let cache = InMemoryMetricsCache::new();
        cache.put_at(&key, &table(), mtime + Duration::seconds(1)).unwrap();
        assert!(cache.get(&key).unwrap().is_some());
        cache.put_at(&key, &table(), mtime - Duration::seconds(1)).unwrap();
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_content_hash_tracks_bytes_not_mtime() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("EDC_Metrics.xlsx");
        let b = dir.path().join("SAE_Dashboard.xlsx");
        std::fs::write(&a, b"ledger").unwrap();
        std::fs::write(&b, b"sae").unwrap();
        let files = vec![a.clone(), b.clone()];

        let key = CacheKey::from_files("S1", &files, InvalidationPolicy::ContentHash).unwrap();
        let cache = InMemoryMetricsCache::new();
        // Build time older than the files still hits while the bytes match
        cache
            .put_at(&key, &table(), key.newest_source().unwrap() - Duration::days(1))
            .unwrap();
        assert!(cache.get(&key).unwrap().is_some());

        // Listing order does not matter
        let reversed = vec![b.clone(), a.clone()];
        let same = CacheKey::from_files("S1", &reversed, InvalidationPolicy::ContentHash).unwrap();
        assert_eq!(same.fingerprint, key.fingerprint);

        std::fs::write(&b, b"sae v2").unwrap();
        let changed = CacheKey::from_files("S1", &files, InvalidationPolicy::ContentHash).unwrap();
        assert_ne!(changed.fingerprint, key.fingerprint);
        assert!(cache.get(&changed).unwrap().is_none());
    }
}
