pub mod constants;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod types;

pub mod config;

// Layered boundaries for application and infrastructure
pub mod app;
pub mod infra;

pub use app::build_metrics_use_case::{list_studies, BuildMetricsUseCase, BuildReport};
pub use pipeline::processing::scoring::{score_site_metrics, ScoringOutcome, ScoringSummary};
