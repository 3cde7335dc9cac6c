//! CSV serialization of return tables and invalid-ticker batches.
//!
//! Missing values are written as empty fields. Numbers use Rust's shortest
//! round-trip formatting, so reading an object back gives the same `f64`s.

use crate::partition;
use crate::period::Period;
use crate::returns::{Cell, ReturnRow, ReturnTable, TIMESTAMP_FORMAT};
use crate::store::{ObjectStore, StoreError};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV output could not be flushed: {0}")]
    Flush(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed returns object: {0}")]
    Parse(String),
}

/// Serialize a table with its full header.
pub fn returns_to_csv(table: &ReturnTable) -> Result<Vec<u8>, SinkError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(&table.columns)?;
    for row in &table.rows {
        wtr.write_record(table.columns.iter().map(|c| format_cell(&row.cell(c))))?;
    }
    wtr.into_inner().map_err(|e| SinkError::Flush(e.to_string()))
}

fn format_cell(cell: &Cell) -> String {
    match cell {
        Cell::Number(v) => v.to_string(),
        Cell::Text(s) => s.clone(),
        Cell::Missing => String::new(),
    }
}

/// Parse a returns object written by [`returns_to_csv`].
///
/// A column reads back as numbers only when every non-empty field in it
/// parses as one, the same rule applied when the table was built.
pub fn read_returns_csv(bytes: &[u8]) -> Result<ReturnTable, SinkError> {
    let mut rdr = csv::Reader::from_reader(bytes);
    let columns: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    let index_of = |name: &str| {
        columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| SinkError::Parse(format!("missing column '{name}'")))
    };
    let ticker_idx = index_of("ticker")?;
    let ts_idx = index_of("download_timestamp")?;
    let date_idx = index_of("date")?;

    let records = rdr.records().collect::<Result<Vec<_>, _>>()?;
    let field = |record: &csv::StringRecord, i: usize| record.get(i).unwrap_or("").to_string();

    let mut rows = Vec::with_capacity(records.len());
    for record in &records {
        let raw_date = field(record, date_idx);
        let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
            .map_err(|e| SinkError::Parse(format!("date '{raw_date}': {e}")))?;
        rows.push(ReturnRow {
            ticker: field(record, ticker_idx),
            download_timestamp: field(record, ts_idx),
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
        });
    }

    for (i, name) in columns.iter().enumerate() {
        if i == ticker_idx || i == ts_idx || i == date_idx {
            continue;
        }
        let values: Vec<String> = records.iter().map(|r| field(r, i)).collect();
        let numbers: Option<Vec<Option<f64>>> = values
            .iter()
            .map(|v| match v.as_str() {
                "" => Some(None),
                v => v.parse::<f64>().ok().map(Some),
            })
            .collect();

        match numbers {
            Some(numbers) => {
                for (row, number) in rows.iter_mut().zip(numbers) {
                    if !row.set_number(name, number) {
                        row.extra
                            .insert(name.clone(), number.map_or(Cell::Missing, Cell::Number));
                    }
                }
            }
            None => {
                for (row, value) in rows.iter_mut().zip(values) {
                    let cell = if value.is_empty() {
                        Cell::Missing
                    } else {
                        Cell::Text(value)
                    };
                    row.extra.insert(name.clone(), cell);
                }
            }
        }
    }

    let ticker = rows.first().map(|r| r.ticker.clone()).unwrap_or_default();
    Ok(ReturnTable {
        ticker,
        columns,
        rows,
    })
}

/// Writes one return object per ticker into the formatted partition.
pub struct ReturnsSink<'a> {
    store: &'a dyn ObjectStore,
    bucket: String,
}

impl<'a> ReturnsSink<'a> {
    pub fn new(store: &'a dyn ObjectStore, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Upload `table`, replacing any object at the same key. Returns the key.
    pub fn upload(
        &self,
        table: &ReturnTable,
        period: Period,
        run_date: NaiveDate,
    ) -> Result<String, SinkError> {
        let key = partition::returns_key(period, run_date, &table.ticker);
        let body = returns_to_csv(table)?;
        self.store.put(&self.bucket, &key, &body)?;
        info!(url = %self.store.object_url(&self.bucket, &key), "upload success");
        Ok(key)
    }
}

/// A ticker whose payload failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTickerRecord {
    pub ticker: String,
    pub recorded_at: NaiveDateTime,
}

/// Accumulates invalid tickers for the run and writes them as one batch.
#[derive(Debug, Default)]
pub struct InvalidTickerSink {
    records: Vec<InvalidTickerRecord>,
}

impl InvalidTickerSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `ticker` as invalid; repeated tickers are kept once.
    pub fn record(&mut self, ticker: &str, at: NaiveDateTime) {
        if self.records.iter().any(|r| r.ticker == ticker) {
            return;
        }
        self.records.push(InvalidTickerRecord {
            ticker: ticker.to_string(),
            recorded_at: at,
        });
    }

    pub fn records(&self) -> &[InvalidTickerRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the accumulated batch and clear it.
    ///
    /// Does nothing and returns `None` when there is nothing to write.
    pub fn flush(
        &mut self,
        store: &dyn ObjectStore,
        bucket: &str,
        run_date: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<Option<String>, SinkError> {
        if self.records.is_empty() {
            return Ok(None);
        }

        let uploaded = now.format(TIMESTAMP_FORMAT).to_string();
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record(["ticker", "recorded_timestamp", "upload_timestamp"])?;
        for r in &self.records {
            let recorded = r.recorded_at.format(TIMESTAMP_FORMAT).to_string();
            wtr.write_record([r.ticker.as_str(), recorded.as_str(), uploaded.as_str()])?;
        }
        let body = wtr
            .into_inner()
            .map_err(|e| SinkError::Flush(e.to_string()))?;

        let key = partition::invalid_tickers_key(run_date, now);
        store.put(bucket, &key, &body)?;
        info!(
            url = %store.object_url(bucket, &key),
            count = self.records.len(),
            "uploaded invalid tickers"
        );
        self.records.clear();
        Ok(Some(key))
    }
}

/// Tickers listed in one invalid-ticker batch.
pub fn read_invalid_tickers(bytes: &[u8]) -> Result<Vec<String>, SinkError> {
    let mut rdr = csv::Reader::from_reader(bytes);
    let idx = rdr
        .headers()?
        .iter()
        .position(|h| h.eq_ignore_ascii_case("ticker"))
        .ok_or_else(|| SinkError::Parse("missing column 'ticker'".into()))?;
    let mut tickers = Vec::new();
    for record in rdr.records() {
        let record = record?;
        if let Some(t) = record.get(idx) {
            if !t.trim().is_empty() {
                tickers.push(t.trim().to_string());
            }
        }
    }
    Ok(tickers)
}
