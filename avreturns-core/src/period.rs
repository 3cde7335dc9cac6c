//! Return period and its provider mapping.
//!
//! The period decides both the provider function that is called and the key of
//! the series section in the response, so the two are kept in one table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sampling period of a downloaded series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Monthly,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported period '{0}': only \"daily\" or \"monthly\" are accepted")]
pub struct UnsupportedPeriod(pub String);

impl Period {
    /// Provider function name for the adjusted series of this period.
    pub fn function_name(self) -> &'static str {
        match self {
            Period::Daily => "TIME_SERIES_DAILY_ADJUSTED",
            Period::Monthly => "TIME_SERIES_MONTHLY_ADJUSTED",
        }
    }

    /// Key of the series section in the provider response.
    pub fn series_key(self) -> &'static str {
        match self {
            Period::Daily => "Time Series (Daily)",
            Period::Monthly => "Monthly Adjusted Time Series",
        }
    }

    /// Lowercase name used in partition keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = UnsupportedPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Period::Daily),
            "monthly" => Ok(Period::Monthly),
            _ => Err(UnsupportedPeriod(s.to_string())),
        }
    }
}
