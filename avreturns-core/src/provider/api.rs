//! Transport to the time-series endpoint.
//!
//! `TimeSeriesApi` is the seam between the fetcher and the network: the
//! fetcher decides which key to use and how to read the answer, the API only
//! moves one request and returns the decoded JSON body.

use crate::period::Period;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Default provider endpoint.
pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";

/// Query parameters of one time-series request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
    pub function: &'static str,
    pub symbol: String,
    pub outputsize: &'static str,
    pub apikey: String,
}

impl QueryParams {
    /// Full-history request for `symbol` with the given key.
    pub fn full_history(period: Period, symbol: &str, apikey: &str) -> Self {
        Self {
            function: period.function_name(),
            symbol: symbol.to_string(),
            outputsize: "full",
            apikey: apikey.to_string(),
        }
    }

    /// Name/value pairs in query-string order.
    pub fn pairs(&self) -> [(&str, &str); 4] {
        [
            ("function", self.function),
            ("symbol", &self.symbol),
            ("outputsize", self.outputsize),
            ("apikey", &self.apikey),
        ]
    }
}

/// Failures below the level of the provider's JSON payload.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network unreachable: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}")]
    Status { status: u16 },

    #[error("response body is not JSON: {0}")]
    Decode(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// One request, one decoded JSON body.
pub trait TimeSeriesApi: Send + Sync {
    fn get(&self, params: &QueryParams) -> Result<Value, TransportError>;
}

/// Blocking HTTP implementation.
pub struct HttpApi {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl TimeSeriesApi for HttpApi {
    fn get(&self, params: &QueryParams) -> Result<Value, TransportError> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&params.pairs())
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(e.to_string())
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        resp.json::<Value>()
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}
