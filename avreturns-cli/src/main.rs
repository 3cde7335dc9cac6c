//! avreturns CLI: download price histories for every constituent of an index
//! and upload total-return tables into a partitioned store.
//!
//! Exit codes: 0 when the queue was processed, 2 when every API key ran out
//! before the queue was finished, 1 on any other fatal error.

mod logging;

use anyhow::{Context, Result};
use avreturns_core::config::Settings;
use avreturns_core::holdings::{CsvHoldingsTable, KnownBadRegistry};
use avreturns_core::pipeline::{run_downloads, LogProgress, RunContext, RunSummary};
use avreturns_core::resolver::{resolve_download_list, ResolveRequest};
use avreturns_core::store::{LocalObjectStore, MemoryObjectStore, ObjectStore};
use avreturns_core::Period;
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

const DEFAULT_CONFIG: &str = "avreturns.toml";

/// Exit status when the run stopped because all API keys were at capacity.
const EXIT_KEYS_EXHAUSTED: i32 = 2;

#[derive(Parser)]
#[command(
    name = "avreturns",
    about = "Download index constituent prices and upload total-return tables"
)]
struct Cli {
    /// Index whose constituents are downloaded (e.g. IWV).
    index_ticker: String,

    /// Series period: daily or monthly.
    period: Period,

    /// Run date (YYYY-MM-DD); also the constituents' as-of date.
    run_date: NaiveDate,

    /// Re-download tickers that already have an upload for this run date.
    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Do not exclude tickers that failed validation in earlier runs.
    #[arg(long, default_value_t = false)]
    keep_known_bad: bool,

    /// TOML settings file. Defaults to ./avreturns.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also write the log to a per-run file in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Keep uploads in memory instead of writing to the store.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let started = avreturns_core::pipeline::local_now();

    let settings = load_settings(&cli)?;
    if let Some(path) = logging::init(cli.log_dir.as_deref(), started)? {
        eprintln!("Logging to {}", path.display());
    }

    let span = tracing::info_span!(
        "run",
        index = %cli.index_ticker,
        rundate = %cli.run_date,
        overwrite = cli.overwrite
    );
    let _guard = span.enter();

    let summary = run(&cli, &settings)?;
    print_summary(&summary);

    if summary.exhausted {
        std::process::exit(EXIT_KEYS_EXHAUSTED);
    }
    Ok(())
}

/// Settings from the config file (if any) with environment overrides, validated.
fn load_settings(cli: &Cli) -> Result<Settings> {
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.is_file() {
                Settings::from_file(&default)?
            } else {
                Settings::default()
            }
        }
    };
    let settings = settings.with_env();
    settings.validate()?;
    Ok(settings)
}

fn run(cli: &Cli, settings: &Settings) -> Result<RunSummary> {
    let pool = settings.key_pool()?;
    let fetcher = settings.price_fetcher()?;
    let local = LocalObjectStore::new(settings.store_root.clone());

    let exclude_known_bad = !cli.keep_known_bad;
    let known_bad = if exclude_known_bad {
        KnownBadRegistry::from_store(&local, &settings.bucket)
            .context("load known-bad tickers")?
    } else {
        KnownBadRegistry::default()
    };
    let holdings = CsvHoldingsTable::from_path(&settings.holdings_csv)
        .with_context(|| format!("read holdings {}", settings.holdings_csv.display()))?
        .with_known_bad(known_bad);

    let request = ResolveRequest {
        index_ticker: cli.index_ticker.clone(),
        period: cli.period,
        run_date: cli.run_date,
        overwrite: cli.overwrite,
        exclude_known_bad,
    };
    let queue = resolve_download_list(&holdings, &local, &settings.bucket, &request)?;

    let dry_store = MemoryObjectStore::new();
    let output: &dyn ObjectStore = if cli.dry_run {
        info!("dry run: uploads are kept in memory");
        &dry_store
    } else {
        &local
    };

    let mut ctx = RunContext::new(
        &fetcher,
        output,
        settings.bucket.as_str(),
        cli.period,
        cli.run_date,
        pool,
    );
    let summary = run_downloads(&mut ctx, &queue, &LogProgress)?;

    if cli.dry_run {
        info!(objects = dry_store.len(), "dry run finished; nothing written");
    }
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!("=== avreturns ===");
    println!("Queued:    {}", summary.total);
    println!("Uploaded:  {}", summary.uploaded);
    println!("Invalid:   {}", summary.invalid);
    println!("Failed:    {}", summary.failed);
    if let Some(key) = &summary.invalid_batch_key {
        println!("Invalid tickers written to {key}");
    }
    if summary.exhausted {
        println!(
            "All API keys at capacity; {} tickers not attempted",
            summary.abandoned.len()
        );
    }
}
