use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use retx_storage::TransactionStore;
use retx_sync::{
    build_scheduler, run_bulk_import_once, run_feed_sync_once, run_shadow_compare_once,
    PipelineConfig, SyncSummary,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "retx-cli")]
#[command(about = "Residential transaction sync pipeline")]
struct Cli {
    /// YAML pipeline config; environment defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one external-feed sync now.
    Sync,
    /// Import a historical bulk file.
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Compare a staged feed run against bulk production rows.
    Shadow {
        #[arg(long)]
        run_id: Uuid,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// List recent comparison reports.
    Reports {
        #[arg(long, default_value_t = 5)]
        limit: i64,
    },
    /// Create or update the database schema.
    Migrate,
    /// Run the in-process cron scheduler until interrupted.
    Schedule,
}

fn print_summary(summary: &SyncSummary) {
    println!(
        "run {} finished: status={} fetched={} promoted={} rejected={}",
        summary.run_id,
        summary.status.as_str(),
        summary.rows_fetched,
        summary.rows_promoted,
        summary.rows_rejected,
    );
    if let Some(passed) = summary.report_passed {
        println!(
            "comparison verdict: {}",
            if passed { "pass" } else { "fail" }
        );
    }
    if let Some(path) = &summary.brief_path {
        println!("run brief: {}", path.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path).await?,
        None => PipelineConfig::from_env(),
    };

    match cli.command {
        Commands::Sync => {
            let summary = run_feed_sync_once(config).await?;
            print_summary(&summary);
        }
        Commands::Import { file } => {
            let summary = run_bulk_import_once(config, &file).await?;
            print_summary(&summary);
        }
        Commands::Shadow { run_id, from, to } => {
            let report = run_shadow_compare_once(config, run_id, (from, to)).await?;
            println!(
                "comparison for {}..{}: bulk={} feed={} row_delta={:.2}% coverage={:.3} verdict={}",
                report.window_start,
                report.window_end,
                report.bulk_rows,
                report.feed_rows,
                report.row_count_delta_pct,
                report.hash_coverage,
                if report.passed { "pass" } else { "fail" },
            );
        }
        Commands::Reports { limit } => {
            let store = TransactionStore::connect(&config.database_url).await?;
            for report in store.latest_reports(limit).await? {
                println!(
                    "{} {}..{} rows {}:{} delta {:.2}% coverage {:.3} {}",
                    report.run_id,
                    report.window_start,
                    report.window_end,
                    report.bulk_rows,
                    report.feed_rows,
                    report.row_count_delta_pct,
                    report.hash_coverage,
                    if report.passed { "pass" } else { "fail" },
                );
            }
        }
        Commands::Migrate => {
            let store = TransactionStore::connect(&config.database_url).await?;
            store.init_schema().await?;
            println!("schema ready");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let mut scheduler = build_scheduler(config)
                .await?
                .context("scheduler construction returned nothing")?;
            scheduler.start().await.context("starting scheduler")?;
            println!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
