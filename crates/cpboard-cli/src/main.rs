use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use cpboard_core::{format_percentile, RatingColumn};
use cpboard_sync::{BoardPipeline, LeaderboardSummary, ScrapeSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cpboard-cli")]
#[command(about = "Competitive-programming cohort leaderboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape Codeforces ratings.
    #[command(name = "codeforces")]
    Codeforces,
    /// Scrape GeeksforGeeks contest scores.
    #[command(name = "gfg", alias = "gfg_contest")]
    Gfg,
    /// Scrape GeeksforGeeks practice scores.
    #[command(name = "gfg_practice")]
    GfgPractice,
    #[command(name = "leetcode")]
    Leetcode,
    #[command(name = "codechef")]
    Codechef,
    #[command(name = "hackerrank")]
    Hackerrank,
    /// Scrape every enabled source in registry order.
    #[command(name = "all")]
    All,
    /// Aggregate stored ratings and publish the leaderboard.
    #[command(name = "build_leaderboard")]
    BuildLeaderboard,
    /// Ingest the roster CSV into the participant store.
    #[command(name = "load_data")]
    LoadData,
    /// Check every roster identifier against its platform and rewrite the existence flags.
    #[command(name = "verify_handles")]
    VerifyHandles,
    /// Run `all` then `build_leaderboard` on the configured cron until Ctrl-C.
    #[command(name = "schedule")]
    Schedule,
}

fn print_scrape(summary: &ScrapeSummary) {
    println!(
        "scrape complete: run_id={} column={} targets={} observed={} file={}",
        summary.run_id, summary.column, summary.targets, summary.observed, summary.ratings_file
    );
}

async fn scrape(pipeline: &BoardPipeline, column: RatingColumn) -> Result<()> {
    print_scrape(&pipeline.scrape(column).await?);
    Ok(())
}

fn print_leaderboard(summary: &LeaderboardSummary) {
    for row in &summary.rows {
        println!(
            "{:>4}  {:<24} {:>7}",
            row.rank,
            row.record.handle,
            row.record.percentile.map(format_percentile).unwrap_or_default()
        );
    }
    println!(
        "leaderboard complete: run_id={} rows={} csv={} manifest={}",
        summary.meta.run_id,
        summary.rows.len(),
        summary.published.csv.absolute_path.display(),
        summary.published.manifest.absolute_path.display()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    tracing::info!(command = ?cli.command, "cpboard starting");
    let pipeline = Arc::new(BoardPipeline::from_env().await?);

    match cli.command {
        Commands::All => {
            for summary in pipeline.scrape_all().await? {
                print_scrape(&summary);
            }
        }
        Commands::BuildLeaderboard => print_leaderboard(&pipeline.build_leaderboard().await?),
        Commands::LoadData => {
            let summary = pipeline.load_roster().await?;
            println!(
                "roster loaded: participants={} path={}",
                summary.participants, summary.path
            );
        }
        Commands::VerifyHandles => {
            let summary = pipeline.verify_handles().await?;
            println!(
                "handles verified: participants={} checked={} found={} path={}",
                summary.participants, summary.checked, summary.found, summary.path
            );
        }
        Commands::Schedule => {
            let cron = pipeline.config().scrape_cron.clone();
            let Some(mut sched) = pipeline.clone().maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set CPBOARD_SCHEDULER_ENABLED=true");
            };
            sched.start().await?;
            println!("scheduler running: cron={cron}; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await?;
        }
        Commands::Codeforces => scrape(&pipeline, RatingColumn::Codeforces).await?,
        Commands::Gfg => scrape(&pipeline, RatingColumn::GfgContest).await?,
        Commands::GfgPractice => scrape(&pipeline, RatingColumn::GfgPractice).await?,
        Commands::Leetcode => scrape(&pipeline, RatingColumn::Leetcode).await?,
        Commands::Codechef => scrape(&pipeline, RatingColumn::Codechef).await?,
        Commands::Hackerrank => scrape(&pipeline, RatingColumn::Hackerrank).await?,
    }

    Ok(())
}
