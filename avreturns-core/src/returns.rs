//! Return table construction.
//!
//! Turns a validated raw series into one row per date, ascending, and derives
//! the dividend yield and total return of each period:
//!
//! - `divyld[t] = dividend_amount[t] / close[t-1]`
//! - `return[t] = adjusted_close[t] / adjusted_close[t-1] - 1 + divyld[t]`
//!
//! Dividends are reported in unadjusted amounts, hence the unadjusted prior
//! close in the yield. Both derived values are missing on the first row and
//! wherever an input is missing or a prior price is zero.

use crate::provider::{RawTimeSeries, TickerRequest, ValidationFailure};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use tracing::{error, info};

/// Format of the `download_timestamp` column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Leading columns of every table.
pub const LEADING_COLUMNS: [&str; 3] = ["ticker", "download_timestamp", "date"];
pub const DIVIDEND_YIELD_COLUMN: &str = "divyld";
pub const TOTAL_RETURN_COLUMN: &str = "return";

const REQUIRED_NUMERIC: [&str; 3] = ["close", "adjusted_close", "dividend_amount"];
const OPTIONAL_NUMERIC: [&str; 5] = ["open", "high", "low", "volume", "split_coefficient"];

/// Value of a pass-through column.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(f64),
    Text(String),
    Missing,
}

/// One trading period of a ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnRow {
    pub ticker: String,
    pub download_timestamp: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adjusted_close: Option<f64>,
    pub volume: Option<f64>,
    pub dividend_amount: Option<f64>,
    pub split_coefficient: Option<f64>,
    /// Provider columns that are not one of the numeric fields above.
    pub extra: BTreeMap<String, Cell>,
    pub dividend_yield: Option<f64>,
    pub total_return: Option<f64>,
}

impl ReturnRow {
    fn empty(ticker: &str, download_timestamp: &str, date: NaiveDate) -> Self {
        Self {
            ticker: ticker.to_string(),
            download_timestamp: download_timestamp.to_string(),
            date,
            open: None,
            high: None,
            low: None,
            close: None,
            adjusted_close: None,
            volume: None,
            dividend_amount: None,
            split_coefficient: None,
            extra: BTreeMap::new(),
            dividend_yield: None,
            total_return: None,
        }
    }

    /// Value of a named column.
    pub fn cell(&self, column: &str) -> Cell {
        if let Some(cell) = self.extra.get(column) {
            return cell.clone();
        }
        let number = match column {
            "ticker" => return Cell::Text(self.ticker.clone()),
            "download_timestamp" => return Cell::Text(self.download_timestamp.clone()),
            "date" => return Cell::Text(self.date.format("%Y-%m-%d").to_string()),
            "open" => self.open,
            "high" => self.high,
            "low" => self.low,
            "close" => self.close,
            "adjusted_close" => self.adjusted_close,
            "volume" => self.volume,
            "dividend_amount" => self.dividend_amount,
            "split_coefficient" => self.split_coefficient,
            DIVIDEND_YIELD_COLUMN => self.dividend_yield,
            TOTAL_RETURN_COLUMN => self.total_return,
            _ => None,
        };
        number.map_or(Cell::Missing, Cell::Number)
    }

    /// Set a named numeric field; returns false if the column is not one.
    pub fn set_number(&mut self, column: &str, value: Option<f64>) -> bool {
        let slot = match column {
            "open" => &mut self.open,
            "high" => &mut self.high,
            "low" => &mut self.low,
            "close" => &mut self.close,
            "adjusted_close" => &mut self.adjusted_close,
            "volume" => &mut self.volume,
            "dividend_amount" => &mut self.dividend_amount,
            "split_coefficient" => &mut self.split_coefficient,
            DIVIDEND_YIELD_COLUMN => &mut self.dividend_yield,
            TOTAL_RETURN_COLUMN => &mut self.total_return,
            _ => return false,
        };
        *slot = value;
        true
    }
}

/// Chronologically ordered return rows of one ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnTable {
    pub ticker: String,
    /// Full header in output order.
    pub columns: Vec<String>,
    pub rows: Vec<ReturnRow>,
}

impl ReturnTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True if any close or adjusted close is zero or negative.
    pub fn has_non_positive_prices(&self) -> bool {
        self.rows.iter().any(|r| {
            r.close.is_some_and(|v| v <= 0.0) || r.adjusted_close.is_some_and(|v| v <= 0.0)
        })
    }
}

/// Lowercase, keep only `[a-z_]` and whitespace, then join words with `_`.
///
/// `"5. adjusted close"` becomes `"adjusted_close"`.
pub fn normalize_column_name(raw: &str) -> String {
    let kept: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || *c == '_' || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Build the return table for one ticker.
pub fn compute_returns(
    raw: &RawTimeSeries,
    request: &TickerRequest,
    downloaded_at: NaiveDateTime,
) -> Result<ReturnTable, ValidationFailure> {
    let ticker = request.ticker().to_uppercase();
    let timestamp = downloaded_at.format(TIMESTAMP_FORMAT).to_string();

    // Provider columns in their numbered order ("1. open" .. "10. x").
    let mut provider_columns: Vec<(String, String)> = Vec::new();
    for fields in raw.series.values() {
        for name in fields.keys() {
            if !provider_columns.iter().any(|(raw_name, _)| raw_name == name) {
                provider_columns.push((name.clone(), normalize_column_name(name)));
            }
        }
    }
    provider_columns.sort_by_key(|(raw_name, _)| field_position(raw_name));

    let mut dated = Vec::with_capacity(raw.series.len());
    for (date, fields) in &raw.series {
        let parsed = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|_| ValidationFailure::BadDate(date.clone()))?;
        dated.push((parsed, fields));
    }
    dated.sort_by_key(|(date, _)| *date);

    let mut rows: Vec<ReturnRow> = dated
        .iter()
        .map(|(date, _)| ReturnRow::empty(&ticker, &timestamp, *date))
        .collect();

    let mut columns: Vec<String> = LEADING_COLUMNS.iter().map(|c| c.to_string()).collect();
    for (raw_name, name) in &provider_columns {
        if name.is_empty() || columns.contains(name) {
            continue;
        }
        let values: Vec<Option<&str>> = dated
            .iter()
            .map(|(_, fields)| fields.get(raw_name).map(String::as_str))
            .collect();

        match numeric_column(&values) {
            Some(numbers) if is_numeric_field(name) => {
                for (row, value) in rows.iter_mut().zip(numbers) {
                    row.set_number(name, value);
                }
            }
            Some(numbers) => {
                for (row, value) in rows.iter_mut().zip(numbers) {
                    row.extra
                        .insert(name.clone(), value.map_or(Cell::Missing, Cell::Number));
                }
            }
            None => {
                if REQUIRED_NUMERIC.contains(&name.as_str()) {
                    return Err(ValidationFailure::NonNumericColumn {
                        column: name.clone(),
                    });
                }
                for (row, value) in rows.iter_mut().zip(&values) {
                    let cell = value.map_or(Cell::Missing, |v| Cell::Text(v.to_string()));
                    row.extra.insert(name.clone(), cell);
                }
            }
        }
        columns.push(name.clone());
    }

    if !rows.is_empty() {
        for required in REQUIRED_NUMERIC {
            if !columns.iter().any(|c| c == required) {
                return Err(ValidationFailure::MissingColumn { column: required });
            }
        }
    }

    derive_returns(&mut rows);
    columns.push(DIVIDEND_YIELD_COLUMN.to_string());
    columns.push(TOTAL_RETURN_COLUMN.to_string());

    let table = ReturnTable {
        ticker,
        columns,
        rows,
    };

    if table.has_non_positive_prices() {
        error!(
            ticker = %table.ticker,
            "zero or negative close/adjusted close prices found; continuing"
        );
    }
    info!(ticker = %table.ticker, rows = table.len(), "returns computed");
    Ok(table)
}

/// Fill `dividend_yield` and `total_return` on rows already sorted by date.
pub fn derive_returns(rows: &mut [ReturnRow]) {
    if let Some(first) = rows.first_mut() {
        first.dividend_yield = None;
        first.total_return = None;
    }
    for t in 1..rows.len() {
        let (prev_close, prev_adj) = (rows[t - 1].close, rows[t - 1].adjusted_close);
        let row = &mut rows[t];
        let dividend_yield = ratio(row.dividend_amount, prev_close);
        let price_return = ratio(row.adjusted_close, prev_adj).map(|r| r - 1.0);
        row.dividend_yield = dividend_yield;
        row.total_return = match (price_return, dividend_yield) {
            (Some(p), Some(d)) => Some(p + d),
            _ => None,
        };
    }
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 && d.is_finite() && n.is_finite() => Some(n / d),
        _ => None,
    }
}

/// Leading number of a provider field name; unnumbered fields sort last.
fn field_position(raw_name: &str) -> u32 {
    let digits: String = raw_name
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(u32::MAX)
}

fn is_numeric_field(name: &str) -> bool {
    REQUIRED_NUMERIC.contains(&name) || OPTIONAL_NUMERIC.contains(&name)
}

/// Parse every present value as a number, or `None` if any value is not one.
fn numeric_column(values: &[Option<&str>]) -> Option<Vec<Option<f64>>> {
    values
        .iter()
        .map(|value| match value.map(str::trim) {
            None | Some("") => Some(None),
            Some(v) => v.parse::<f64>().ok().map(Some),
        })
        .collect()
}
