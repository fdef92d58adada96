use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use site_risk::app::build_metrics_use_case::{list_studies, BuildMetricsUseCase, BuildReport};
use site_risk::app::ports::MetricsOutputPort;
use site_risk::app::score_metrics_use_case::ScoreMetricsUseCase;
use site_risk::config::Config;
use site_risk::constants::{ANOMALY_SCORE_COLUMN, COUNTRY_COLUMN, REGION_COLUMN, SITE_ID_COLUMN};
use site_risk::infra::calamine_reader::CalamineWorkbookReader;
use site_risk::infra::scored_output_adapter::FileMetricsOutputAdapter;
use site_risk::logging;
use site_risk::pipeline::ingestion::shutdown_runtime;
use site_risk::pipeline::processing::scoring::{ScoringOutcome, ScoringSummary};
use site_risk::pipeline::storage::{MetricsCache, SqliteMetricsCache};

#[derive(Parser)]
#[command(name = "site_risk")]
#[command(about = "Clinical study site metrics builder and anomaly scorer")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "SITE_RISK_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List study folders under the study root
    Studies,
    /// Build (or load from cache) the canonical site metrics table for a study
    Build {
        /// Study folder name under the study root
        #[arg(long)]
        study: String,
    },
    /// Build the canonical table, then score every site for anomalies
    Score {
        /// Study folder name under the study root
        #[arg(long)]
        study: String,
    },
    /// Drop cached tables for one study, or all studies
    ClearCache {
        #[arg(long)]
        study: Option<String>,
    },
}

fn print_build_report(report: &BuildReport) {
    println!("\n📊 Site metrics for {}:", report.study);
    println!("   Run id: {}", report.run_id);
    println!("   Sites: {}", report.table.len());
    println!("   From cache: {}", if report.cache_hit { "yes" } else { "no" });

    if report.is_degraded() {
        warn!("{} degradations during build", report.degradations.len());
        println!("\n⚠️  Degradations:");
        for degradation in &report.degradations {
            println!("   - {}", degradation);
        }
    }

    if !report.table.is_empty() {
        println!(
            "\n   {:<16} {:<14} {:<12} {:>8} {:>8} {:>6}",
            SITE_ID_COLUMN, COUNTRY_COLUMN, REGION_COLUMN, "Queries", "Missing", "SAEs"
        );
        for row in report.table.rows() {
            println!(
                "   {:<16} {:<14} {:<12} {:>8} {:>8} {:>6}",
                row.site_id, row.country, row.region, row.query_count, row.missing_page_count, row.sae_count
            );
        }
    }
}

fn print_summary(summary: &ScoringSummary) {
    println!("\n🔎 Risk summary:");
    println!("   Total sites: {}", summary.total_sites);
    println!("   Anomalous sites: {}", summary.anomalous_sites);
    println!("   Avg queries per site: {:.1}", summary.mean_queries_per_site);
    println!("   Total missing pages: {}", summary.total_missing_pages);
    println!("   Total SAEs: {}", summary.total_saes);
    if !summary.country_risk.is_empty() {
        println!("\n   Country risk (lowest mean score first):");
        for country in &summary.country_risk {
            println!(
                "   - {:<14} {:>4} sites  mean score {:+.4}",
                country.country, country.sites, country.mean_anomaly_score
            );
        }
    }
}

fn build_use_case(config: &Config, cache: Arc<dyn MetricsCache>) -> BuildMetricsUseCase {
    BuildMetricsUseCase::new(&config.paths.study_root, Arc::new(CalamineWorkbookReader::new()), cache)
        .with_settings(config.ingestion_settings())
        .with_invalidation(config.cache.invalidation)
}

fn open_cache(config: &Config) -> anyhow::Result<Arc<dyn MetricsCache>> {
    let cache = SqliteMetricsCache::open(&config.paths.cache_db)
        .with_context(|| format!("opening cache at {}", config.paths.cache_db.display()))?;
    Ok(Arc::new(cache))
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(run(cli));
    // A workbook read abandoned at its deadline must not keep the process alive
    shutdown_runtime(runtime);
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;

    // Initialize logging; the guard flushes the file writer on exit
    let _guard = logging::init_logging(&config.paths.log_dir, logging::DEFAULT_DIRECTIVE)?;
    info!(config = %cli.config.display(), study_root = %config.paths.study_root.display(), "Starting site_risk");

    match cli.command {
        Commands::Studies => {
            let studies = list_studies(&config.paths.study_root)
                .with_context(|| format!("listing studies in {}", config.paths.study_root.display()))?;
            if studies.is_empty() {
                println!("⚠️  No study folders under {}", config.paths.study_root.display());
            }
            for study in studies {
                println!("{}", study);
            }
        }
        Commands::Build { study } => {
            println!("🔄 Building site metrics for {}...", study);
            let use_case = build_use_case(&config, open_cache(&config)?);
            let report = use_case.build(&study).await;
            print_build_report(&report);

            let output = FileMetricsOutputAdapter::new(&config.paths.output_dir);
            let path = output.write_site_metrics(&study, &report.table).await?;
            println!("\n✅ Canonical table written to {}", path);
        }
        Commands::Score { study } => {
            println!("🚀 Building and scoring site metrics for {}...", study);
            let use_case = build_use_case(&config, open_cache(&config)?);
            let report = use_case.build(&study).await;
            print_build_report(&report);

            let output = FileMetricsOutputAdapter::new(&config.paths.output_dir);
            output.write_site_metrics(&study, &report.table).await?;

            let scoring = ScoreMetricsUseCase::new(config.scorer(), Box::new(output));
            let scored = scoring.score(&study, &report.table).await?;
            match &scored.outcome {
                ScoringOutcome::Scored(table) => {
                    if let Some(summary) = &scored.summary {
                        print_summary(summary);
                    }
                    let anomalies = table.anomalies();
                    if !anomalies.is_empty() {
                        println!("\n🚩 Anomalous sites (most anomalous first):");
                        println!("   {:<18} {:<14} {}", SITE_ID_COLUMN, COUNTRY_COLUMN, ANOMALY_SCORE_COLUMN);
                        for row in anomalies {
                            println!(
                                "   - {:<16} {:<14} {:+.4}",
                                row.metrics.site_id, row.metrics.country, row.anomaly_score
                            );
                        }
                    }
                    if let Some(path) = &scored.output_path {
                        println!("\n✅ Scored table written to {}", path);
                    }
                }
                ScoringOutcome::InsufficientData(reason) => {
                    warn!(%reason, "Nothing to score");
                    println!("\n⚠️  Insufficient data to score {}: {}", study, reason);
                }
            }
        }
        Commands::ClearCache { study } => {
            let cache = open_cache(&config)?;
            match study {
                Some(study) => {
                    let removed = cache.remove(&study)?;
                    if removed {
                        println!("🧹 Cleared cached table for {}", study);
                    } else {
                        println!("No cached table for {}", study);
                    }
                }
                None => {
                    let n = cache.clear()?;
                    println!("🧹 Cleared {} cached table(s)", n);
                }
            }
        }
    }
    Ok(())
}
