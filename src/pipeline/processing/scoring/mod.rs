//! Unsupervised per-site risk scoring.
//!
//! The canonical table's numeric feature columns are fed to an
//! [`OutlierModel`]; the default model is a seeded [`IsolationForest`].

pub mod isolation_forest;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::{info, instrument, warn};

pub use isolation_forest::{IsolationForest, IsolationForestParams};

use crate::constants::FEATURE_COLUMNS;
use crate::observability::metrics;
use crate::types::{AnomalyLabel, CanonicalSiteMetrics, ScoredSiteMetrics, ScoredSiteRow};

/// Dense row-major matrix of numeric features, one row per site
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    rows: Vec<Vec<f64>>,
    n_features: usize,
}

impl FeatureMatrix {
    /// Rows are expected to share a width; the first row fixes it
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
        Self { rows, n_features }
    }

    /// Project `features` out of the canonical table, in the given column order
    pub fn from_table(table: &CanonicalSiteMetrics, features: &[String]) -> Result<Self, InsufficientData> {
        if table.is_empty() {
            return Err(InsufficientData::EmptyTable);
        }
        if features.is_empty() {
            return Err(InsufficientData::NoFeatures);
        }
        let mut rows = Vec::with_capacity(table.len());
        for row in table.rows() {
            let mut values = Vec::with_capacity(features.len());
            for name in features {
                match row.feature(name) {
                    Some(v) => values.push(v),
                    None => return Err(InsufficientData::MissingFeature(name.clone())),
                }
            }
            rows.push(values);
        }
        Ok(Self::from_rows(rows))
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn value(&self, row: usize, feature: usize) -> f64 {
        self.rows[row][feature]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.rows[row]
    }
}

/// Per-row continuous score plus discrete label, aligned with the input rows
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierScores {
    pub scores: Vec<f64>,
    pub labels: Vec<AnomalyLabel>,
}

/// Outlier model seam; implementations refit on every call
pub trait OutlierModel: Send + Sync {
    fn fit_score(&self, features: &FeatureMatrix) -> OutlierScores;
}

/// Why a table could not be scored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsufficientData {
    EmptyTable,
    NoFeatures,
    MissingFeature(String),
}

impl fmt::Display for InsufficientData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsufficientData::EmptyTable => write!(f, "canonical table is empty"),
            InsufficientData::NoFeatures => write!(f, "no feature columns configured"),
            InsufficientData::MissingFeature(name) => write!(f, "feature column '{}' is not in the table", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoringOutcome {
    Scored(ScoredSiteMetrics),
    InsufficientData(InsufficientData),
}

impl ScoringOutcome {
    pub fn scored(&self) -> Option<&ScoredSiteMetrics> {
        match self {
            ScoringOutcome::Scored(scored) => Some(scored),
            ScoringOutcome::InsufficientData(_) => None,
        }
    }

    pub fn into_scored(self) -> Option<ScoredSiteMetrics> {
        match self {
            ScoringOutcome::Scored(scored) => Some(scored),
            ScoringOutcome::InsufficientData(_) => None,
        }
    }
}

/// Fits the configured model over the configured feature columns
pub struct AnomalyScorer {
    model: Box<dyn OutlierModel>,
    features: Vec<String>,
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self::new(
            Box::new(IsolationForest::default()),
            FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        )
    }
}

impl AnomalyScorer {
    pub fn new(model: Box<dyn OutlierModel>, features: Vec<String>) -> Self {
        Self { model, features }
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    #[instrument(skip_all, fields(sites = table.len()))]
    pub fn score(&self, table: &CanonicalSiteMetrics) -> ScoringOutcome {
        let matrix = match FeatureMatrix::from_table(table, &self.features) {
            Ok(m) => m,
            Err(reason) => {
                warn!(reason = %reason, "Scoring skipped: insufficient data");
                metrics::scoring::insufficient_data();
                return ScoringOutcome::InsufficientData(reason);
            }
        };

        let OutlierScores { scores, labels } = self.model.fit_score(&matrix);
        let rows: Vec<ScoredSiteRow> = table
            .rows()
            .iter()
            .zip(scores)
            .zip(labels)
            .map(|((row, anomaly_score), is_anomaly)| ScoredSiteRow {
                metrics: row.clone(),
                anomaly_score,
                is_anomaly,
            })
            .collect();
        let scored = ScoredSiteMetrics::new(rows);

        let anomalies = scored.anomalies().len();
        metrics::scoring::scored(scored.len(), anomalies);
        info!(sites = scored.len(), anomalies, "Scored site metrics");
        ScoringOutcome::Scored(scored)
    }
}

/// Score with the default isolation forest over the three count columns
pub fn score_site_metrics(table: &CanonicalSiteMetrics) -> ScoringOutcome {
    AnomalyScorer::default().score(table)
}

/// Mean anomaly score for one country
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryRisk {
    pub country: String,
    pub sites: usize,
    pub mean_anomaly_score: f64,
}

/// Study-level headline figures over a scored table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringSummary {
    pub total_sites: usize,
    pub anomalous_sites: usize,
    pub mean_queries_per_site: f64,
    pub total_missing_pages: u64,
    pub total_saes: u64,
    /// Riskiest (lowest mean score) first
    pub country_risk: Vec<CountryRisk>,
}

impl ScoringSummary {
    pub fn from_scored(scored: &ScoredSiteMetrics) -> Self {
        let rows = scored.rows();
        let total_sites = rows.len();
        let total_queries: u64 = rows.iter().map(|r| r.metrics.query_count).sum();
        let mean_queries_per_site = if total_sites == 0 {
            0.0
        } else {
            total_queries as f64 / total_sites as f64
        };

        let mut by_country: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
        for row in rows {
            let entry = by_country.entry(row.metrics.country.as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += row.anomaly_score;
        }
        let mut country_risk: Vec<CountryRisk> = by_country
            .into_iter()
            .map(|(country, (sites, sum))| CountryRisk {
                country: country.to_string(),
                sites,
                mean_anomaly_score: sum / sites as f64,
            })
            .collect();
        // Stable sort keeps country name order among equal means
        country_risk.sort_by(|a, b| a.mean_anomaly_score.total_cmp(&b.mean_anomaly_score));

        Self {
            total_sites,
            anomalous_sites: rows.iter().filter(|r| r.is_anomaly.is_anomalous()).count(),
            mean_queries_per_site,
            total_missing_pages: rows.iter().map(|r| r.metrics.missing_page_count).sum(),
            total_saes: rows.iter().map(|r| r.metrics.sae_count).sum(),
            country_risk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SiteMetricsRow;
    use tracing_test::traced_test;

    fn site(id: &str, country: &str, q: u64, m: u64, s: u64) -> SiteMetricsRow {
        SiteMetricsRow {
            site_id: id.to_string(),
            country: country.to_string(),
            region: "Global".to_string(),
            query_count: q,
            missing_page_count: m,
            sae_count: s,
        }
    }

    fn study_table() -> CanonicalSiteMetrics {
        let mut rows = Vec::new();
        for i in 0..19 {
            let country = if i % 2 == 0 { "US" } else { "FR" };
            rows.push(site(&format!("Site-{:02}", i), country, 10 + i % 4, 1 + i % 2, i % 2));
        }
        rows.push(site("Site-99", "DE", 150, 30, 8));
        CanonicalSiteMetrics::new(rows)
    }

    /// Flags every row whose first feature exceeds a threshold
    struct ThresholdModel(f64);

    impl OutlierModel for ThresholdModel {
        fn fit_score(&self, features: &FeatureMatrix) -> OutlierScores {
            let scores: Vec<f64> = (0..features.n_rows()).map(|i| self.0 - features.value(i, 0)).collect();
            let labels = scores
                .iter()
                .map(|&s| if s < 0.0 { AnomalyLabel::Anomalous } else { AnomalyLabel::Normal })
                .collect();
            OutlierScores { scores, labels }
        }
    }

    #[test]
    fn test_feature_matrix_follows_configured_order() {
        let table = CanonicalSiteMetrics::new(vec![site("A", "US", 3, 2, 1)]);
        let features = vec!["sae_count".to_string(), "query_count".to_string()];
        let matrix = FeatureMatrix::from_table(&table, &features).unwrap();
        assert_eq!(matrix.n_rows(), 1);
        assert_eq!(matrix.n_features(), 2);
        assert_eq!(matrix.row(0), &[1.0, 3.0]);
    }

    #[test]
    fn test_empty_table_is_insufficient_data() {
        let outcome = score_site_metrics(&CanonicalSiteMetrics::empty());
        assert_eq!(outcome, ScoringOutcome::InsufficientData(InsufficientData::EmptyTable));
        assert!(outcome.scored().is_none());
    }

    #[test]
    fn test_unknown_feature_is_insufficient_data() {
        let scorer = AnomalyScorer::new(
            Box::new(IsolationForest::default()),
            vec!["query_count".to_string(), "enrolled_subjects".to_string()],
        );
        let outcome = scorer.score(&study_table());
        assert_eq!(
            outcome,
            ScoringOutcome::InsufficientData(InsufficientData::MissingFeature("enrolled_subjects".to_string()))
        );
    }

    #[test]
    fn test_scored_table_keeps_rows_and_flags_the_outlier() {
        let table = study_table();
        let scored = score_site_metrics(&table).into_scored().unwrap();
        assert_eq!(scored.len(), table.len());
        for (scored_row, row) in scored.rows().iter().zip(table.rows()) {
            assert_eq!(&scored_row.metrics, row);
            assert!(scored_row.anomaly_score.is_finite());
        }
        let anomalies = scored.anomalies();
        assert!(!anomalies.is_empty());
        assert_eq!(anomalies[0].metrics.site_id, "Site-99");
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let table = study_table();
        assert_eq!(score_site_metrics(&table), score_site_metrics(&table));
    }

    #[test]
    fn test_model_is_pluggable() {
        let scorer = AnomalyScorer::new(Box::new(ThresholdModel(100.0)), vec!["query_count".to_string()]);
        let scored = scorer.score(&study_table()).into_scored().unwrap();
        let flagged: Vec<&str> = scored.anomalies().iter().map(|r| r.metrics.site_id.as_str()).collect();
        assert_eq!(flagged, vec!["Site-99"]);
    }

    #[test]
    fn test_summary_headline_figures() {
        let scorer = AnomalyScorer::new(Box::new(ThresholdModel(100.0)), vec!["query_count".to_string()]);
        let table = CanonicalSiteMetrics::new(vec![
            site("A", "US", 10, 1, 0),
            site("B", "US", 20, 0, 1),
            site("C", "DE", 150, 4, 2),
        ]);
        let scored = scorer.score(&table).into_scored().unwrap();
        let summary = ScoringSummary::from_scored(&scored);

        assert_eq!(summary.total_sites, 3);
        assert_eq!(summary.anomalous_sites, 1);
        assert!((summary.mean_queries_per_site - 60.0).abs() < 1e-12);
        assert_eq!(summary.total_missing_pages, 5);
        assert_eq!(summary.total_saes, 3);
        let countries: Vec<&str> = summary.country_risk.iter().map(|c| c.country.as_str()).collect();
        assert_eq!(countries, vec!["DE", "US"]);
        assert_eq!(summary.country_risk[0].mean_anomaly_score, -50.0);
        assert_eq!(summary.country_risk[1].sites, 2);
    }

    #[test]
    fn test_summary_of_empty_table() {
        let summary = ScoringSummary::from_scored(&ScoredSiteMetrics::default());
        assert_eq!(summary.total_sites, 0);
        assert_eq!(summary.mean_queries_per_site, 0.0);
        assert!(summary.country_risk.is_empty());
    }

    #[test]
    #[traced_test]
    fn test_insufficient_data_is_logged() {
        score_site_metrics(&CanonicalSiteMetrics::empty());
        assert!(logs_contain("insufficient data"));
        assert!(logs_contain("canonical table is empty"));
    }
}
