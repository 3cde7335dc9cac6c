//! Per-ticker download through the key pool.

use super::api::{QueryParams, TimeSeriesApi, TransportError};
use super::response::{quota_note, Freshness, RawTimeSeries, ValidationFailure};
use crate::keys::{KeyPool, Outcome, PoolError};
use crate::period::Period;
use chrono::NaiveDate;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// One ticker to download for a period and run date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerRequest {
    ticker: String,
    period: Period,
    run_date: NaiveDate,
}

impl TickerRequest {
    pub fn new(ticker: impl Into<String>, period: Period, run_date: NaiveDate) -> Self {
        Self {
            ticker: ticker.into(),
            period,
            run_date,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    /// Symbol as sent to the provider, with wildcard markers removed.
    pub fn query_symbol(&self) -> String {
        self.ticker.replace('*', "")
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("transport failure for {ticker}: {source}")]
    Transport {
        ticker: String,
        #[source]
        source: TransportError,
    },

    #[error("invalid response for {ticker}: {failure}")]
    Invalid {
        ticker: String,
        failure: ValidationFailure,
    },
}

/// Upper bound on transport retries per request.
pub const MAX_TRANSPORT_RETRIES: u32 = 10;

/// Longest single backoff pause.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// `base * 2^(attempt - 1)`, capped at [`MAX_BACKOFF`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Downloads raw series, rotating keys on quota notices.
pub struct PriceFetcher {
    api: Box<dyn TimeSeriesApi>,
    max_transport_retries: u32,
    base_delay: Duration,
}

impl PriceFetcher {
    pub fn new(api: Box<dyn TimeSeriesApi>) -> Self {
        Self {
            api,
            max_transport_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }

    /// Retries for network-level failures on the same key, with exponential backoff.
    ///
    /// `max_retries` is clamped to [`MAX_TRANSPORT_RETRIES`].
    pub fn with_transport_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_transport_retries = max_retries.min(MAX_TRANSPORT_RETRIES);
        self.base_delay = base_delay;
        self
    }

    /// Fetch and validate the full history for `request`.
    ///
    /// Keeps asking with the pool's current key until a response without a
    /// quota notice arrives or the pool is exhausted.
    pub fn fetch(
        &self,
        request: &TickerRequest,
        pool: &mut KeyPool,
    ) -> Result<RawTimeSeries, FetchError> {
        let symbol = request.query_symbol();

        loop {
            let credential = pool.acquire()?;
            let params = QueryParams::full_history(request.period(), &symbol, credential.key());
            let body = self.get_with_retry(&params, request.ticker())?;

            if let Some(note) = quota_note(&body) {
                info!(
                    ticker = request.ticker(),
                    key_index = credential.index() + 1,
                    note,
                    "quota notice from provider"
                );
                pool.record_outcome(&credential, Outcome::QuotaExceeded);
                continue;
            }
            pool.record_outcome(&credential, Outcome::Ok);

            let series =
                RawTimeSeries::from_response(&body, request.period()).map_err(|failure| {
                    error!(ticker = request.ticker(), %failure, "improper response object");
                    FetchError::Invalid {
                        ticker: request.ticker().to_string(),
                        failure,
                    }
                })?;

            match series.freshness(request.run_date()) {
                Freshness::Current => {}
                Freshness::Stale { last_refreshed } => warn!(
                    ticker = request.ticker(),
                    %last_refreshed,
                    "provider pricing is delayed"
                ),
                Freshness::Unknown => error!(
                    ticker = request.ticker(),
                    "meta data is missing a usable \"3. Last Refreshed\" item"
                ),
            }
            return Ok(series);
        }
    }

    fn get_with_retry(&self, params: &QueryParams, ticker: &str) -> Result<Value, FetchError> {
        let mut last_error = None;

        for attempt in 0..=self.max_transport_retries {
            if attempt > 0 {
                std::thread::sleep(backoff_delay(self.base_delay, attempt));
            }
            match self.api.get(params) {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(ticker, attempt, error = %e, "transport failure");
                    last_error = Some(e);
                }
            }
        }

        Err(FetchError::Transport {
            ticker: ticker.to_string(),
            source: last_error
                .unwrap_or_else(|| TransportError::Network("no attempt made".into())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Throttle;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct NoPause;
    impl Throttle for NoPause {
        fn pause(&self, _: Duration) {}
    }

    type Calls = Arc<Mutex<Vec<QueryParams>>>;

    struct Scripted {
        replies: Mutex<VecDeque<Result<Value, TransportError>>>,
        calls: Calls,
    }

    impl TimeSeriesApi for Scripted {
        fn get(&self, params: &QueryParams) -> Result<Value, TransportError> {
            self.calls.lock().unwrap().push(params.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"Note": "Thank you for using the API"})))
        }
    }

    fn fetcher(replies: Vec<Result<Value, TransportError>>) -> (PriceFetcher, Calls) {
        let calls = Calls::default();
        let api = Scripted {
            replies: Mutex::new(replies.into()),
            calls: calls.clone(),
        };
        let fetcher =
            PriceFetcher::new(Box::new(api)).with_transport_retries(2, Duration::ZERO);
        (fetcher, calls)
    }

    fn pool(n: usize) -> KeyPool {
        let keys = (1..=n).map(|i| format!("k{i}")).collect();
        KeyPool::new(keys, 5, Duration::from_secs(60), Box::new(NoPause)).unwrap()
    }

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 5, 29).unwrap()
    }

    fn good_body() -> Value {
        json!({
            "Meta Data": {"3. Last Refreshed": "2020-05-29"},
            "Time Series (Daily)": {
                "2020-05-28": {"4. close": "10.0", "5. adjusted close": "10.0", "7. dividend amount": "0.0"}
            }
        })
    }

    fn quota() -> Value {
        json!({"Note": "Thank you for using Alpha Vantage! daily limit reached"})
    }

    #[test]
    fn strips_wildcards_from_symbol() {
        let req = TickerRequest::new("BRK*B*", Period::Daily, run_date());
        assert_eq!(req.query_symbol(), "BRKB");
    }

    #[test]
    fn successful_fetch_uses_current_key() {
        let (fetcher, calls) = fetcher(vec![Ok(good_body())]);
        let mut pool = pool(2);
        let req = TickerRequest::new("IBM*", Period::Daily, run_date());
        let raw = fetcher.fetch(&req, &mut pool).unwrap();
        assert_eq!(raw.len(), 1);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].symbol, "IBM");
        assert_eq!(calls[0].apikey, "k1");
        assert_eq!(calls[0].function, "TIME_SERIES_DAILY_ADJUSTED");
        assert_eq!(pool.usage_count(), 1);
    }

    #[test]
    fn quota_notice_switches_key_and_retries() {
        let (fetcher, calls) = fetcher(vec![Ok(quota()), Ok(good_body())]);
        let mut pool = pool(3);
        let req = TickerRequest::new("IBM", Period::Daily, run_date());
        fetcher.fetch(&req, &mut pool).unwrap();

        let keys: Vec<String> = calls.lock().unwrap().iter().map(|c| c.apikey.clone()).collect();
        assert_eq!(keys, vec!["k1", "k2"]);
        assert_eq!(pool.current_index(), 1);
        assert_eq!(pool.usage_count(), 2);
    }

    #[test]
    fn exhaustion_surfaces_as_pool_error() {
        let (fetcher, calls) = fetcher(vec![Ok(quota()), Ok(quota())]);
        let mut pool = pool(2);
        let req = TickerRequest::new("IBM", Period::Daily, run_date());
        let err = fetcher.fetch(&req, &mut pool).unwrap_err();
        assert!(matches!(err, FetchError::Pool(PoolError::Exhausted { keys: 2 })));
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert!(pool.is_exhausted());
    }

    #[test]
    fn malformed_response_is_invalid_but_counts_as_key_use() {
        let (fetcher, _) = fetcher(vec![Ok(json!({"Error Message": "Invalid API call"}))]);
        let mut pool = pool(1);
        let req = TickerRequest::new("ZZZ", Period::Daily, run_date());
        let err = fetcher.fetch(&req, &mut pool).unwrap_err();
        match err {
            FetchError::Invalid { ticker, failure } => {
                assert_eq!(ticker, "ZZZ");
                assert_eq!(failure, ValidationFailure::MissingMetaData);
            }
            other => panic!("expected invalid, got {other:?}"),
        }
        assert_eq!(pool.usage_count(), 1);
        assert!(!pool.is_exhausted());
    }

    #[test]
    fn stale_data_is_still_returned() {
        let (fetcher, _) = fetcher(vec![Ok(good_body())]);
        let mut pool = pool(1);
        let later = NaiveDate::from_ymd_opt(2020, 6, 30).unwrap();
        let req = TickerRequest::new("IBM", Period::Daily, later);
        assert!(fetcher.fetch(&req, &mut pool).is_ok());
    }

    #[test]
    fn transport_errors_retry_without_rotating() {
        let (fetcher, calls) = fetcher(vec![
            Err(TransportError::Status { status: 503 }),
            Ok(good_body()),
        ]);
        let mut pool = pool(2);
        let req = TickerRequest::new("IBM", Period::Daily, run_date());
        fetcher.fetch(&req, &mut pool).unwrap();

        let keys: Vec<String> = calls.lock().unwrap().iter().map(|c| c.apikey.clone()).collect();
        assert_eq!(keys, vec!["k1", "k1"]);
        assert_eq!(pool.current_index(), 0);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 33), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn retry_count_is_clamped() {
        let (fetcher, _calls) = fetcher(Vec::new());
        let fetcher = fetcher.with_transport_retries(u32::MAX, Duration::ZERO);
        assert_eq!(fetcher.max_transport_retries, MAX_TRANSPORT_RETRIES);
    }

    #[test]
    fn transport_errors_give_up_after_retries() {
        let (fetcher, calls) = fetcher(vec![
            Err(TransportError::Network("refused".into())),
            Err(TransportError::Network("refused".into())),
            Err(TransportError::Timeout("slow".into())),
        ]);
        let mut pool = pool(2);
        let req = TickerRequest::new("IBM", Period::Daily, run_date());
        let err = fetcher.fetch(&req, &mut pool).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Transport {
                source: TransportError::Timeout(_),
                ..
            }
        ));
        assert_eq!(calls.lock().unwrap().len(), 3);
        assert!(!pool.is_exhausted());
        assert_eq!(pool.usage_count(), 0);
    }
}
