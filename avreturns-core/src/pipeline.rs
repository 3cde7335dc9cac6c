//! Download orchestrator: fetch → compute returns → upload, one ticker at a time.
//!
//! Tickers run strictly in queue order because the key pool's counters are
//! shared across them. Invalid tickers are collected in an
//! [`InvalidTickerSink`] and flushed once when the run ends, including when it
//! ends early because every API key is at capacity.

use crate::keys::KeyPool;
use crate::period::Period;
use crate::provider::{FetchError, PriceFetcher, TickerRequest, ValidationFailure};
use crate::returns::compute_returns;
use crate::sink::{InvalidTickerSink, ReturnsSink, SinkError};
use crate::store::ObjectStore;
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to write invalid-ticker batch: {0}")]
    InvalidTickerFlush(#[source] SinkError),
}

/// What happened to one ticker.
#[derive(Debug)]
pub enum TickerOutcome {
    Uploaded { key: String, rows: usize },
    Invalid(ValidationFailure),
    Failed(String),
}

/// Progress callbacks for a run.
pub trait DownloadProgress {
    fn on_start(&self, ticker: &str, index: usize, total: usize);

    fn on_complete(&self, ticker: &str, index: usize, total: usize, outcome: &TickerOutcome);

    fn on_batch_complete(&self, summary: &RunSummary);
}

/// Progress reporter that writes to the log.
pub struct LogProgress;

impl DownloadProgress for LogProgress {
    fn on_start(&self, ticker: &str, index: usize, total: usize) {
        info!(ticker, "[{}/{}] processing", index + 1, total);
    }

    fn on_complete(&self, ticker: &str, _index: usize, _total: usize, outcome: &TickerOutcome) {
        match outcome {
            TickerOutcome::Uploaded { rows, .. } => info!(ticker, rows, "uploaded"),
            TickerOutcome::Invalid(failure) => warn!(ticker, %failure, "invalid ticker"),
            TickerOutcome::Failed(reason) => error!(ticker, %reason, "ticker failed"),
        }
    }

    fn on_batch_complete(&self, summary: &RunSummary) {
        info!(
            total = summary.total,
            uploaded = summary.uploaded,
            invalid = summary.invalid,
            failed = summary.failed,
            abandoned = summary.abandoned.len(),
            exhausted = summary.exhausted,
            "run complete"
        );
    }
}

/// Result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub uploaded: usize,
    pub invalid: usize,
    pub failed: usize,
    /// Tickers never attempted because the key pool ran out.
    pub abandoned: Vec<String>,
    /// True if the run stopped early on key-pool exhaustion.
    pub exhausted: bool,
    /// Key of the invalid-ticker batch, if one was written.
    pub invalid_batch_key: Option<String>,
}

impl RunSummary {
    pub fn completed(&self) -> bool {
        !self.exhausted
    }
}

/// Source of timestamps, replaceable in tests.
pub type Clock = fn() -> NaiveDateTime;

/// Local wall-clock time.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Collaborators and mutable state of one run.
pub struct RunContext<'a> {
    pub fetcher: &'a PriceFetcher,
    pub store: &'a dyn ObjectStore,
    pub bucket: String,
    pub period: Period,
    pub run_date: NaiveDate,
    pub pool: KeyPool,
    pub invalid: InvalidTickerSink,
    pub clock: Clock,
}

impl<'a> RunContext<'a> {
    pub fn new(
        fetcher: &'a PriceFetcher,
        store: &'a dyn ObjectStore,
        bucket: impl Into<String>,
        period: Period,
        run_date: NaiveDate,
        pool: KeyPool,
    ) -> Self {
        Self {
            fetcher,
            store,
            bucket: bucket.into(),
            period,
            run_date,
            pool,
            invalid: InvalidTickerSink::new(),
            clock: local_now,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

/// Download `tickers` in order: fetch → compute returns → upload.
///
/// Stops early when the key pool is exhausted; the remaining tickers are
/// reported as abandoned. The invalid-ticker batch is written once at the end
/// of every run that recorded at least one invalid ticker.
pub fn run_downloads(
    ctx: &mut RunContext<'_>,
    tickers: &[String],
    progress: &dyn DownloadProgress,
) -> Result<RunSummary, PipelineError> {
    let total = tickers.len();
    let mut summary = RunSummary {
        total,
        ..RunSummary::default()
    };

    for (i, raw_ticker) in tickers.iter().enumerate() {
        let ticker = normalize_ticker(raw_ticker);
        let ticker = ticker.as_str();
        progress.on_start(ticker, i, total);

        let outcome = match download_single(ctx, ticker) {
            Ok(outcome) => outcome,
            Err(FetchError::Pool(e)) => {
                error!(error = %e, "all available api keys used; stopping run");
                summary.exhausted = true;
                summary.abandoned = tickers[i..].iter().map(|t| normalize_ticker(t)).collect();
                break;
            }
            Err(FetchError::Invalid { failure, .. }) => TickerOutcome::Invalid(failure),
            Err(e @ FetchError::Transport { .. }) => TickerOutcome::Failed(e.to_string()),
        };

        match &outcome {
            TickerOutcome::Uploaded { .. } => summary.uploaded += 1,
            TickerOutcome::Invalid(_) => {
                ctx.invalid.record(ticker, (ctx.clock)());
                summary.invalid += 1;
            }
            TickerOutcome::Failed(_) => summary.failed += 1,
        }
        progress.on_complete(ticker, i, total, &outcome);
    }

    let now = (ctx.clock)();
    summary.invalid_batch_key = ctx
        .invalid
        .flush(ctx.store, &ctx.bucket, ctx.run_date, now)
        .map_err(PipelineError::InvalidTickerFlush)?;

    progress.on_batch_complete(&summary);
    Ok(summary)
}

/// Queue entries are upper-cased and trimmed before use.
fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

/// One ticker: fetch → compute → upload.
fn download_single(ctx: &mut RunContext<'_>, ticker: &str) -> Result<TickerOutcome, FetchError> {
    let request = TickerRequest::new(ticker, ctx.period, ctx.run_date);
    let downloaded_at = (ctx.clock)();
    let raw = ctx.fetcher.fetch(&request, &mut ctx.pool)?;

    let table = match compute_returns(&raw, &request, downloaded_at) {
        Ok(table) => table,
        Err(failure) => return Ok(TickerOutcome::Invalid(failure)),
    };

    let sink = ReturnsSink::new(ctx.store, ctx.bucket.as_str());
    Ok(match sink.upload(&table, ctx.period, ctx.run_date) {
        Ok(key) => TickerOutcome::Uploaded {
            key,
            rows: table.len(),
        },
        Err(e) => TickerOutcome::Failed(format!("upload failed: {e}")),
    })
}
