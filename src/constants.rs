//! Canonical column names shared by the cached table, the scored table and
//! the feature lookup used by the scorer.

pub const SITE_ID_COLUMN: &str = "Site ID";
pub const COUNTRY_COLUMN: &str = "Country";
pub const REGION_COLUMN: &str = "Region";

pub const QUERY_COUNT_COLUMN: &str = "query_count";
pub const MISSING_PAGE_COUNT_COLUMN: &str = "missing_page_count";
pub const SAE_COUNT_COLUMN: &str = "sae_count";

pub const ANOMALY_SCORE_COLUMN: &str = "anomaly_score";
pub const IS_ANOMALY_COLUMN: &str = "is_anomaly";

/// Metadata defaults applied when a site's country or region is unknown
pub const DEFAULT_COUNTRY: &str = "Unknown";
pub const DEFAULT_REGION: &str = "Global";

/// Numeric feature columns fed to the outlier model, in matrix column order
pub const FEATURE_COLUMNS: [&str; 3] = [
    QUERY_COUNT_COLUMN,
    MISSING_PAGE_COUNT_COLUMN,
    SAE_COUNT_COLUMN,
];

/// Workbook extensions considered spreadsheet sources (compared lowercase)
pub const SPREADSHEET_EXTENSIONS: [&str; 4] = ["xlsx", "xlsm", "xls", "ods"];

// Isolation forest defaults
pub const DEFAULT_CONTAMINATION: f64 = 0.1;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_N_TREES: usize = 100;
pub const DEFAULT_MAX_SAMPLES: usize = 256;

// Ingestion defaults
pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 120;
/// How long runtime shutdown waits for blocking reads before abandoning them
pub const ABANDONED_READ_GRACE_MS: u64 = 500;

/// Turn a study folder name into a file-system friendly slug for output files
pub fn study_slug(study: &str) -> String {
    study
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
