use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::column_resolver::{resolve, Concept};
use crate::app::ports::WorkbookReader;
use crate::constants::SPREADSHEET_EXTENSIONS;
use crate::types::{Degradation, DegradationKind, RawTable, RawTableRow, SourceKind};

// ---------------------------------------------------------------------------
// Source specs
// ---------------------------------------------------------------------------

/// A filename keyword and how much it contributes to a file's rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordWeight {
    pub keyword: &'static str,
    pub weight: u32,
}

const fn kw(keyword: &'static str, weight: u32) -> KeywordWeight {
    KeywordWeight { keyword, weight }
}

/// A column concept plus the ordered aliases tried before the synonym fallback
#[derive(Debug, Clone, Copy)]
pub struct ColumnRule {
    pub concept: Concept,
    pub aliases: &'static [&'static str],
}

/// Everything needed to find and read one logical source in a study folder
#[derive(Debug, Clone, Copy)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub keywords: &'static [KeywordWeight],
    /// A file must reach this rank to be selected
    pub min_score: u32,
    pub site: ColumnRule,
    pub country: Option<ColumnRule>,
    pub region: Option<ColumnRule>,
}

pub const LEDGER_SPEC: SourceSpec = SourceSpec {
    kind: SourceKind::Ledger,
    // "edc metrics" outranks a bare "edc" file
    keywords: &[kw("edc", 2), kw("metrics", 1)],
    min_score: 2,
    site: ColumnRule {
        concept: Concept::Site,
        aliases: &["Site ID", "Site number", "Site", "SITE"],
    },
    country: Some(ColumnRule {
        concept: Concept::Country,
        aliases: &["Country", "COUNTRY"],
    }),
    region: Some(ColumnRule {
        concept: Concept::Region,
        aliases: &["Region", "REGION"],
    }),
};

pub const MISSING_PAGES_SPEC: SourceSpec = SourceSpec {
    kind: SourceKind::MissingPages,
    keywords: &[kw("missing", 1), kw("pages", 1)],
    min_score: 2,
    site: ColumnRule {
        concept: Concept::Site,
        aliases: &["Site number", "Site", "SITE"],
    },
    country: None,
    region: None,
};

pub const ADVERSE_EVENTS_SPEC: SourceSpec = SourceSpec {
    kind: SourceKind::AdverseEvents,
    keywords: &[kw("sae", 1)],
    min_score: 1,
    site: ColumnRule {
        concept: Concept::Site,
        aliases: &["Site ID", "Site No", "Site", "SITE"],
    },
    country: None,
    region: None,
};

impl SourceSpec {
    pub fn for_kind(kind: SourceKind) -> &'static SourceSpec {
        match kind {
            SourceKind::Ledger => &LEDGER_SPEC,
            SourceKind::MissingPages => &MISSING_PAGES_SPEC,
            SourceKind::AdverseEvents => &ADVERSE_EVENTS_SPEC,
        }
    }
}

// ---------------------------------------------------------------------------
// File ranking and selection
// ---------------------------------------------------------------------------

/// Ranks a normalized filename against a kind's keywords
pub type FileRanker = fn(&str, &[KeywordWeight]) -> u32;

static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[_\s]+").unwrap());

/// Lowercase the name and collapse underscores/whitespace into single spaces
pub fn normalize_filename(name: &str) -> String {
    SEPARATORS.replace_all(&name.to_lowercase(), " ").into_owned()
}

/// Default ranker: sum of the weights of keywords contained in the name
pub fn keyword_score(normalized_name: &str, keywords: &[KeywordWeight]) -> u32 {
    keywords
        .iter()
        .filter(|k| normalized_name.contains(k.keyword))
        .map(|k| k.weight)
        .sum()
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// True for workbook files, excluding Office lock files and hidden files
pub fn is_spreadsheet(path: &Path) -> bool {
    let name = file_name(path);
    if name.starts_with("~$") || name.starts_with('.') {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SPREADSHEET_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Spreadsheet files directly inside `dir`, sorted by file name
pub fn list_spreadsheets(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_spreadsheet(&path) {
            files.push(path);
        }
    }
    files.sort_by_key(|p| file_name(p));
    Ok(files)
}

/// Best-ranked file for `spec` by keywords alone; ties go to the earlier file
fn best_match<'a>(files: &'a [PathBuf], spec: &SourceSpec, ranker: FileRanker) -> Option<&'a PathBuf> {
    let mut best: Option<(u32, &PathBuf)> = None;
    for path in files {
        let score = ranker(&normalize_filename(&file_name(path)), spec.keywords);
        if score < spec.min_score || score == 0 {
            continue;
        }
        match best {
            Some((best_score, _)) if best_score >= score => {}
            _ => best = Some((score, path)),
        }
    }
    best.map(|(_, path)| path)
}

/// Pick the best-ranked file for `spec`; ties go to the earlier file.
///
/// The ledger falls back to the first spreadsheet when nothing qualifies, so
/// the primary source is always attempted.
pub fn select_source_file(files: &[PathBuf], spec: &SourceSpec, ranker: FileRanker) -> Option<PathBuf> {
    match best_match(files, spec, ranker) {
        Some(path) => Some(path.clone()),
        None if spec.kind == SourceKind::Ledger => {
            let fallback = files.first().cloned();
            if let Some(path) = &fallback {
                info!(
                    source = %spec.kind,
                    file = %file_name(path),
                    "No file matched ledger keywords; falling back to first spreadsheet"
                );
            }
            fallback
        }
        None => None,
    }
}

/// The file chosen for each source kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSelection {
    pub ledger: Option<PathBuf>,
    pub missing_pages: Option<PathBuf>,
    pub adverse_events: Option<PathBuf>,
}

impl SourceSelection {
    /// A file that matches the ledger keywords is claimed by the ledger and
    /// is not offered to the other sources. The ledger's first-spreadsheet
    /// fallback claims nothing.
    pub fn select(files: &[PathBuf], ranker: FileRanker) -> Self {
        let claimed = best_match(files, &LEDGER_SPEC, ranker);
        let rest: Vec<PathBuf> = files.iter().filter(|f| Some(*f) != claimed).cloned().collect();
        Self {
            ledger: select_source_file(files, &LEDGER_SPEC, ranker),
            missing_pages: select_source_file(&rest, &MISSING_PAGES_SPEC, ranker),
            adverse_events: select_source_file(&rest, &ADVERSE_EVENTS_SPEC, ranker),
        }
    }

    pub fn get(&self, kind: SourceKind) -> Option<&PathBuf> {
        match kind {
            SourceKind::Ledger => self.ledger.as_ref(),
            SourceKind::MissingPages => self.missing_pages.as_ref(),
            SourceKind::AdverseEvents => self.adverse_events.as_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// A source table together with the degradations hit while producing it
#[derive(Debug, Clone)]
pub struct SourceReadOutcome {
    pub table: RawTable,
    pub degradations: Vec<Degradation>,
}

impl SourceReadOutcome {
    pub fn degraded(kind: SourceKind, degradation: Degradation) -> Self {
        Self {
            table: RawTable::empty(kind),
            degradations: vec![degradation],
        }
    }
}

/// Log a degradation and count it
pub fn record_degradation(degradation: &Degradation) {
    crate::observability::metrics::ingestion::degradation(degradation.kind, degradation.source);
    let file = degradation.file.as_deref().unwrap_or("-");
    match degradation.kind {
        DegradationKind::ReadFailure => warn!(
            kind = %degradation.kind,
            source = %degradation.source,
            file = %file,
            reason = %degradation.reason,
            "Source degraded to empty"
        ),
        DegradationKind::SourceUnavailable | DegradationKind::ColumnUnresolved => info!(
            kind = %degradation.kind,
            source = %degradation.source,
            file = %file,
            reason = %degradation.reason,
            "Source degraded"
        ),
    }
}

fn degrade(kind: DegradationKind, spec: &SourceSpec, file: Option<String>, reason: String) -> Degradation {
    let degradation = Degradation::new(kind, spec.kind, file, reason);
    record_degradation(&degradation);
    degradation
}

fn clean_cell(cell: Option<&Option<String>>) -> Option<String> {
    cell.and_then(|c| c.as_deref())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Read one logical source: header scan, column resolution, narrow read, rename.
///
/// Never fails; every problem becomes a degradation and an empty table.
pub fn read_source(reader: &dyn WorkbookReader, spec: &SourceSpec, path: Option<&Path>) -> SourceReadOutcome {
    let Some(path) = path else {
        let d = degrade(
            DegradationKind::SourceUnavailable,
            spec,
            None,
            "no matching file in study folder".to_string(),
        );
        return SourceReadOutcome::degraded(spec.kind, d);
    };
    let name = file_name(path);

    let headers = match reader.read_header(path) {
        Ok(h) => h,
        Err(e) => {
            let d = degrade(DegradationKind::ReadFailure, spec, Some(name), format!("header scan failed: {}", e));
            return SourceReadOutcome::degraded(spec.kind, d);
        }
    };

    let Some(site) = resolve(spec.site.concept, spec.site.aliases, &headers) else {
        let d = degrade(
            DegradationKind::ColumnUnresolved,
            spec,
            Some(name),
            format!("no header matched concept '{}'", spec.site.concept),
        );
        return SourceReadOutcome::degraded(spec.kind, d);
    };
    debug!(source = %spec.kind, header = %site.header, matched_by = ?site.matched_by, "Resolved site column");

    let mut degradations = Vec::new();
    let mut resolve_optional = |rule: Option<ColumnRule>| -> Option<usize> {
        let rule = rule?;
        match resolve(rule.concept, rule.aliases, &headers) {
            Some(c) => Some(c.index),
            None => {
                degradations.push(degrade(
                    DegradationKind::ColumnUnresolved,
                    spec,
                    Some(name.clone()),
                    format!("no header matched concept '{}'; default applied", rule.concept),
                ));
                None
            }
        }
    };
    let country = resolve_optional(spec.country);
    let region = resolve_optional(spec.region);

    let mut columns = vec![site.index];
    columns.extend(country);
    columns.extend(region);

    let raw_rows = match reader.read_columns(path, &columns) {
        Ok(rows) => rows,
        Err(e) => {
            degradations.push(degrade(DegradationKind::ReadFailure, spec, Some(name), format!("column read failed: {}", e)));
            return SourceReadOutcome {
                table: RawTable::empty(spec.kind),
                degradations,
            };
        }
    };

    let country_pos = country.map(|_| 1);
    let region_pos = region.map(|_| if country.is_some() { 2 } else { 1 });
    let rows: Vec<RawTableRow> = raw_rows
        .iter()
        .map(|cells| RawTableRow {
            site_id: clean_cell(cells.first()),
            country: country_pos.and_then(|i| clean_cell(cells.get(i))),
            region: region_pos.and_then(|i| clean_cell(cells.get(i))),
        })
        .filter(|r| r.site_id.is_some() || r.country.is_some() || r.region.is_some())
        .collect();

    info!(source = %spec.kind, file = %name, rows = rows.len(), "Read source");
    crate::observability::metrics::ingestion::rows_read(spec.kind, rows.len());

    SourceReadOutcome {
        table: RawTable {
            kind: spec.kind,
            file: Some(path.to_path_buf()),
            rows,
        },
        degradations,
    }
}
