//! Hive-style object keys.
//!
//! Layout:
//! - `type=pricing/state=formatted/period={period}/rundate={date}/ticker={TICKER}.csv`
//! - `type=pricing/state=invalid_tickers/rundate={date}/{YYYYmmddHHMMSS}.csv`

use crate::period::Period;
use chrono::{NaiveDate, NaiveDateTime};

const ROOT: &str = "type=pricing";

/// Prefix under which the invalid-ticker batches of every run live.
pub fn invalid_tickers_root() -> String {
    format!("{ROOT}/state=invalid_tickers/")
}

/// Prefix of the return objects of one period and run date, up to `ticker=`.
pub fn formatted_ticker_prefix(period: Period, run_date: NaiveDate) -> String {
    format!("{ROOT}/state=formatted/period={period}/rundate={run_date}/ticker=")
}

/// Key of one ticker's return table.
pub fn returns_key(period: Period, run_date: NaiveDate, ticker: &str) -> String {
    format!("{}{ticker}.csv", formatted_ticker_prefix(period, run_date))
}

/// Key of one invalid-ticker batch.
pub fn invalid_tickers_key(run_date: NaiveDate, uploaded_at: NaiveDateTime) -> String {
    format!(
        "{}rundate={run_date}/{}.csv",
        invalid_tickers_root(),
        uploaded_at.format("%Y%m%d%H%M%S")
    )
}
