//! Which tickers still need downloading for an index, period and run date.

use crate::holdings::{ConstituentQuery, HoldingsTable, QueryError};
use crate::partition;
use crate::period::Period;
use crate::store::{list_keys, ListOptions, ObjectStore, StoreError};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("constituent query failed: {0}")]
    Query(#[from] QueryError),

    #[error("listing existing uploads failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub index_ticker: String,
    pub period: Period,
    pub run_date: NaiveDate,
    /// Download every constituent, even if already uploaded for this run date.
    pub overwrite: bool,
    /// Leave out tickers in the known-bad registry.
    pub exclude_known_bad: bool,
}

/// Sorted, upper-cased tickers to download.
///
/// Without `overwrite`, tickers that already have a returns object under the
/// period/run-date partition are skipped, so repeated runs resume where the
/// last one stopped.
pub fn resolve_download_list(
    holdings: &dyn HoldingsTable,
    store: &dyn ObjectStore,
    bucket: &str,
    request: &ResolveRequest,
) -> Result<Vec<String>, ResolveError> {
    let query = ConstituentQuery {
        index_ticker: request.index_ticker.clone(),
        as_of: request.run_date,
        exclude_known_bad: request.exclude_known_bad,
    };
    let constituents: BTreeSet<String> = holdings
        .query(&query)?
        .into_iter()
        .map(|row| row.ticker.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect();

    let queue: Vec<String> = if request.overwrite {
        constituents.into_iter().collect()
    } else {
        let existing = already_downloaded(store, bucket, request.period, request.run_date)?;
        constituents.difference(&existing).cloned().collect()
    };

    info!(
        index = %request.index_ticker,
        queued = queue.len(),
        "queued tickers for download"
    );
    Ok(queue)
}

/// Upper-cased tickers with a returns object for `period` and `run_date`.
pub fn already_downloaded(
    store: &dyn ObjectStore,
    bucket: &str,
    period: Period,
    run_date: NaiveDate,
) -> Result<BTreeSet<String>, StoreError> {
    let opts = ListOptions {
        full_path: false,
        remove_ext: true,
        ..ListOptions::default()
    };
    let prefix = partition::formatted_ticker_prefix(period, run_date);
    Ok(list_keys(store, bucket, &prefix, &opts)?
        .into_iter()
        .map(|t| t.to_uppercase())
        .collect())
}
