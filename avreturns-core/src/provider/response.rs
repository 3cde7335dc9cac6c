//! Typed reading of provider payloads.
//!
//! A payload is either a quota notice, or a document with a `Meta Data`
//! section and a period-specific series section. Anything else is malformed.

use crate::period::Period;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

const META_KEY: &str = "Meta Data";
const NOTE_KEY: &str = "Note";
const QUOTA_NOTE_PREFIX: &str = "thank you";

/// Reasons a ticker's payload cannot be turned into a return table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("response has no \"Meta Data\" section")]
    MissingMetaData,

    #[error("response has no \"{section}\" section")]
    MissingSeries { section: &'static str },

    #[error("unparseable date '{0}' in series")]
    BadDate(String),

    #[error("required column '{column}' is missing")]
    MissingColumn { column: &'static str },

    #[error("column '{column}' is not numeric")]
    NonNumericColumn { column: String },
}

/// Returns the quota notice text if the payload is one.
pub fn quota_note(body: &Value) -> Option<&str> {
    body.get(NOTE_KEY)
        .and_then(Value::as_str)
        .filter(|note| {
            note.trim_start()
                .to_ascii_lowercase()
                .starts_with(QUOTA_NOTE_PREFIX)
        })
}

#[derive(Debug, Deserialize)]
struct MetaSection {
    #[serde(rename = "3. Last Refreshed")]
    last_refreshed: Option<String>,
}

/// How current the provider's data is relative to the run date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Current,
    Stale { last_refreshed: NaiveDate },
    Unknown,
}

/// Validated provider payload: metadata plus raw per-date fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTimeSeries {
    /// Raw `3. Last Refreshed` value, if present.
    pub last_refreshed: Option<String>,
    /// Date string → raw field name → raw value.
    pub series: BTreeMap<String, BTreeMap<String, String>>,
}

impl RawTimeSeries {
    /// Validate a decoded payload for `period`.
    pub fn from_response(body: &Value, period: Period) -> Result<Self, ValidationFailure> {
        let meta = body
            .get(META_KEY)
            .filter(|m| m.is_object())
            .ok_or(ValidationFailure::MissingMetaData)?;
        let meta: MetaSection =
            serde_json::from_value(meta.clone()).map_err(|_| ValidationFailure::MissingMetaData)?;

        let section = body
            .get(period.series_key())
            .and_then(Value::as_object)
            .ok_or(ValidationFailure::MissingSeries {
                section: period.series_key(),
            })?;

        let mut series = BTreeMap::new();
        for (date, fields) in section {
            let Some(fields) = fields.as_object() else {
                return Err(ValidationFailure::MissingSeries {
                    section: period.series_key(),
                });
            };
            let fields = fields
                .iter()
                .map(|(name, value)| (name.clone(), raw_value(value)))
                .collect();
            series.insert(date.clone(), fields);
        }

        Ok(Self {
            last_refreshed: meta.last_refreshed,
            series,
        })
    }

    /// Last refresh date; only the leading `YYYY-MM-DD` is read.
    pub fn last_refreshed_date(&self) -> Option<NaiveDate> {
        let raw = self.last_refreshed.as_deref()?;
        let day = raw.get(..10).unwrap_or(raw);
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }

    pub fn freshness(&self, run_date: NaiveDate) -> Freshness {
        match self.last_refreshed_date() {
            None => Freshness::Unknown,
            Some(last) if last < run_date => Freshness::Stale {
                last_refreshed: last,
            },
            Some(_) => Freshness::Current,
        }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

fn raw_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
