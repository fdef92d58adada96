use anyhow::Result;
use tracing::info;

use crate::app::ports::MetricsOutputPort;
use crate::pipeline::processing::scoring::{AnomalyScorer, ScoringOutcome, ScoringSummary};
use crate::types::CanonicalSiteMetrics;

/// What scoring a study produced, and where the scored table went
#[derive(Debug, Clone)]
pub struct ScoreReport {
    pub outcome: ScoringOutcome,
    pub summary: Option<ScoringSummary>,
    pub output_path: Option<String>,
}

/// Use case for scoring a canonical table and persisting the scored table
pub struct ScoreMetricsUseCase {
    scorer: AnomalyScorer,
    output: Box<dyn MetricsOutputPort>,
}

impl ScoreMetricsUseCase {
    pub fn new(scorer: AnomalyScorer, output: Box<dyn MetricsOutputPort>) -> Self {
        Self { scorer, output }
    }

    /// Create a use case with the default isolation forest scorer
    pub fn with_default_scorer(output: Box<dyn MetricsOutputPort>) -> Self {
        Self::new(AnomalyScorer::default(), output)
    }

    /// Score `table`; nothing is written when the data is insufficient
    pub async fn score(&self, study: &str, table: &CanonicalSiteMetrics) -> Result<ScoreReport> {
        let outcome = self.scorer.score(table);
        let Some(scored) = outcome.scored() else {
            return Ok(ScoreReport {
                outcome,
                summary: None,
                output_path: None,
            });
        };

        let summary = ScoringSummary::from_scored(scored);
        let output_path = self.output.write_scored_site_metrics(study, scored).await?;
        info!(
            study,
            sites = summary.total_sites,
            anomalies = summary.anomalous_sites,
            output = %output_path,
            "Scored table written"
        );

        Ok(ScoreReport {
            outcome,
            summary: Some(summary),
            output_path: Some(output_path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::scoring::InsufficientData;
    use crate::types::{ScoredSiteMetrics, SiteMetricsRow};
    use std::sync::{Arc, Mutex};

    /// Records what would have been written
    #[derive(Clone, Default)]
    struct RecordingOutput {
        scored: Arc<Mutex<Vec<(String, usize)>>>,
    }

    #[async_trait::async_trait]
    impl MetricsOutputPort for RecordingOutput {
        async fn write_site_metrics(&self, study: &str, _table: &CanonicalSiteMetrics) -> anyhow::Result<String> {
            Ok(format!("{}_site_metrics.json", study))
        }

        async fn write_scored_site_metrics(&self, study: &str, scored: &ScoredSiteMetrics) -> anyhow::Result<String> {
            self.scored.lock().unwrap().push((study.to_string(), scored.len()));
            Ok(format!("{}_scored_site_metrics.json", study))
        }
    }

    fn table() -> CanonicalSiteMetrics {
        CanonicalSiteMetrics::new(
            (0..12)
                .map(|i| SiteMetricsRow {
                    site_id: format!("Site-{:02}", i),
                    country: "US".into(),
                    region: "West".into(),
                    query_count: if i == 11 { 90 } else { 5 + i % 3 },
                    missing_page_count: i % 2,
                    sae_count: 0,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_scores_and_writes_table() {
        let output = RecordingOutput::default();
        let use_case = ScoreMetricsUseCase::with_default_scorer(Box::new(output.clone()));

        let report = use_case.score("STUDY-1", &table()).await.unwrap();
        assert!(report.outcome.scored().is_some());
        assert_eq!(report.summary.unwrap().total_sites, 12);
        assert_eq!(report.output_path.as_deref(), Some("STUDY-1_scored_site_metrics.json"));
        assert_eq!(*output.scored.lock().unwrap(), vec![("STUDY-1".to_string(), 12)]);
    }

    #[tokio::test]
    async fn test_insufficient_data_writes_nothing() {
        let output = RecordingOutput::default();
        let use_case = ScoreMetricsUseCase::with_default_scorer(Box::new(output.clone()));

        let report = use_case.score("STUDY-1", &CanonicalSiteMetrics::empty()).await.unwrap();
        assert_eq!(report.outcome, ScoringOutcome::InsufficientData(InsufficientData::EmptyTable));
        assert!(report.summary.is_none());
        assert!(output.scored.lock().unwrap().is_empty());
    }
}
