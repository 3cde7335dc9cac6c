//! Index constituents and the known-bad ticker registry.
//!
//! Constituents come from a holdings table with one row per
//! (index, as-of date, ticker). The known-bad registry is the union of every
//! invalid-ticker batch previously written to the object store.

use crate::partition;
use crate::sink::{read_invalid_tickers, SinkError};
use crate::store::{list_keys, ListOptions, ObjectStore, StoreError};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("holdings CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid-ticker batch {key}: {source}")]
    Batch {
        key: String,
        #[source]
        source: SinkError,
    },
}

/// Constituent lookup for one index as of a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstituentQuery {
    pub index_ticker: String,
    pub as_of: NaiveDate,
    pub exclude_known_bad: bool,
}

impl ConstituentQuery {
    /// Equivalent SQL for tabular backends.
    pub fn to_sql(&self) -> String {
        let mut sql = format!(
            "select distinct Ticker from holdings where etf = '{}' and asofdate <= date '{}' and Ticker <> ''",
            self.index_ticker.replace('\'', "''"),
            self.as_of
        );
        if self.exclude_known_bad {
            sql.push_str(" and Ticker not in (select distinct Ticker from invalid_tickers)");
        }
        sql
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HoldingRow {
    pub ticker: String,
}

/// Source of index constituents.
pub trait HoldingsTable {
    fn query(&self, query: &ConstituentQuery) -> Result<Vec<HoldingRow>, QueryError>;
}

/// Upper-cased tickers that previously failed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownBadRegistry {
    tickers: BTreeSet<String>,
}

impl KnownBadRegistry {
    pub fn from_tickers<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tickers: tickers
                .into_iter()
                .map(|t| t.as_ref().trim().to_uppercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Load every invalid-ticker batch in `bucket`.
    pub fn from_store(store: &dyn ObjectStore, bucket: &str) -> Result<Self, QueryError> {
        let opts = ListOptions {
            suffix: ".csv".into(),
            ..ListOptions::default()
        };
        let mut tickers = BTreeSet::new();
        for key in list_keys(store, bucket, &partition::invalid_tickers_root(), &opts)? {
            let bytes = store.get(bucket, &key)?;
            let batch = read_invalid_tickers(&bytes)
                .map_err(|source| QueryError::Batch { key: key.clone(), source })?;
            tickers.extend(batch.into_iter().map(|t| t.to_uppercase()));
        }
        info!(count = tickers.len(), "loaded known-bad tickers");
        Ok(Self { tickers })
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.tickers.contains(&ticker.trim().to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HoldingRecord {
    #[serde(alias = "ETF", alias = "Etf")]
    etf: String,
    #[serde(alias = "AsOfDate", alias = "asOfDate")]
    asofdate: NaiveDate,
    #[serde(alias = "Ticker")]
    ticker: String,
}

/// Holdings table read from a CSV file with `etf,asofdate,ticker` columns.
#[derive(Debug, Clone, Default)]
pub struct CsvHoldingsTable {
    records: Vec<HoldingRecord>,
    known_bad: KnownBadRegistry,
}

impl CsvHoldingsTable {
    pub fn from_path(path: &Path) -> Result<Self, QueryError> {
        let rdr = csv::Reader::from_path(path)?;
        Self::from_csv(rdr)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, QueryError> {
        Self::from_csv(csv::Reader::from_reader(reader))
    }

    fn from_csv<R: Read>(mut rdr: csv::Reader<R>) -> Result<Self, QueryError> {
        let records = rdr
            .deserialize::<HoldingRecord>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            records,
            known_bad: KnownBadRegistry::default(),
        })
    }

    pub fn with_known_bad(mut self, known_bad: KnownBadRegistry) -> Self {
        self.known_bad = known_bad;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl HoldingsTable for CsvHoldingsTable {
    fn query(&self, query: &ConstituentQuery) -> Result<Vec<HoldingRow>, QueryError> {
        debug!(sql = %query.to_sql(), "constituent query");
        let tickers: BTreeSet<&str> = self
            .records
            .iter()
            .filter(|r| r.etf.trim().eq_ignore_ascii_case(query.index_ticker.trim()))
            .filter(|r| r.asofdate <= query.as_of)
            .map(|r| r.ticker.trim())
            .filter(|t| !t.is_empty())
            .filter(|t| !(query.exclude_known_bad && self.known_bad.contains(t)))
            .collect();
        Ok(tickers
            .into_iter()
            .map(|t| HoldingRow {
                ticker: t.to_string(),
            })
            .collect())
    }
}
