//! End-to-end runs of resolver + pipeline against a scripted provider and an
//! in-memory object store.

use avreturns_core::holdings::{CsvHoldingsTable, KnownBadRegistry};
use avreturns_core::keys::{KeyPool, Throttle};
use avreturns_core::partition;
use avreturns_core::pipeline::{run_downloads, DownloadProgress, RunContext, RunSummary, TickerOutcome};
use avreturns_core::provider::{PriceFetcher, QueryParams, TimeSeriesApi, TransportError};
use avreturns_core::resolver::{resolve_download_list, ResolveRequest};
use avreturns_core::sink::{read_invalid_tickers, read_returns_csv};
use avreturns_core::store::{list_keys, ListOptions, MemoryObjectStore, ObjectStore};
use avreturns_core::Period;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

const BUCKET: &str = "pricing";

const HOLDINGS: &str = "\
etf,asofdate,ticker
IWV,2020-05-29,AAPL
IWV,2020-05-29,BAD
IWV,2020-05-29,IBM
IWV,2020-05-29,MSFT
";

struct NoPause;

impl Throttle for NoPause {
    fn pause(&self, _: Duration) {}
}

/// Replies per symbol; anything unscripted gets a quota notice.
#[derive(Default)]
struct ScriptedApi {
    replies: Mutex<HashMap<String, VecDeque<Result<Value, TransportError>>>>,
}

impl ScriptedApi {
    fn reply(self, symbol: &str, reply: Result<Value, TransportError>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .push_back(reply);
        self
    }
}

impl TimeSeriesApi for ScriptedApi {
    fn get(&self, params: &QueryParams) -> Result<Value, TransportError> {
        self.replies
            .lock()
            .unwrap()
            .get_mut(&params.symbol)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(json!({"Note": "Thank you for using Alpha Vantage!"})))
    }
}

#[derive(Default)]
struct RecordingProgress {
    started: RefCell<Vec<String>>,
    batches: RefCell<usize>,
}

impl DownloadProgress for RecordingProgress {
    fn on_start(&self, ticker: &str, _index: usize, _total: usize) {
        self.started.borrow_mut().push(ticker.to_string());
    }

    fn on_complete(&self, _: &str, _: usize, _: usize, _: &TickerOutcome) {}

    fn on_batch_complete(&self, _summary: &RunSummary) {
        *self.batches.borrow_mut() += 1;
    }
}

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 5, 29).unwrap()
}

fn fixed_clock() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 5, 29)
        .unwrap()
        .and_hms_opt(18, 30, 0)
        .unwrap()
}

fn daily_body() -> Value {
    json!({
        "Meta Data": {
            "1. Information": "Daily Time Series with Splits and Dividend Events",
            "3. Last Refreshed": "2020-05-29"
        },
        "Time Series (Daily)": {
            "2020-05-29": {
                "1. open": "100.0", "2. high": "101.0", "3. low": "99.0", "4. close": "100.0",
                "5. adjusted close": "100.0", "6. volume": "1000",
                "7. dividend amount": "0.0000", "8. split coefficient": "1.0"
            },
            "2020-05-27": {
                "1. open": "100.0", "2. high": "101.0", "3. low": "99.0", "4. close": "100.0",
                "5. adjusted close": "98.0", "6. volume": "1000",
                "7. dividend amount": "0.0000", "8. split coefficient": "1.0"
            },
            "2020-05-28": {
                "1. open": "100.0", "2. high": "101.0", "3. low": "99.0", "4. close": "100.0",
                "5. adjusted close": "99.0", "6. volume": "1000",
                "7. dividend amount": "1.0000", "8. split coefficient": "1.0"
            }
        }
    })
}

fn error_body() -> Value {
    json!({"Error Message": "Invalid API call. Please retry or visit the documentation."})
}

fn pool(keys: usize) -> KeyPool {
    let keys = (1..=keys).map(|i| format!("key{i}")).collect();
    KeyPool::new(keys, 5, Duration::from_secs(60), Box::new(NoPause)).unwrap()
}

fn fetcher(api: ScriptedApi) -> PriceFetcher {
    PriceFetcher::new(Box::new(api)).with_transport_retries(1, Duration::ZERO)
}

fn tickers(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

fn invalid_batches(store: &MemoryObjectStore) -> Vec<String> {
    let opts = ListOptions {
        suffix: ".csv".into(),
        ..ListOptions::default()
    };
    list_keys(store, BUCKET, &partition::invalid_tickers_root(), &opts).unwrap()
}

#[test]
fn malformed_ticker_is_recorded_once_and_not_uploaded() {
    let api = ScriptedApi::default()
        .reply("AAPL", Ok(daily_body()))
        .reply("ZZZ", Ok(error_body()))
        .reply("IBM", Ok(daily_body()));
    let fetcher = fetcher(api);
    let store = MemoryObjectStore::new();
    let progress = RecordingProgress::default();
    let mut ctx = RunContext::new(&fetcher, &store, BUCKET, Period::Daily, run_date(), pool(1))
        .with_clock(fixed_clock);

    let summary = run_downloads(&mut ctx, &tickers(&["AAPL", "ZZZ", "IBM"]), &progress).unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.invalid, 1);
    assert_eq!(summary.failed, 0);
    assert!(summary.completed());
    assert_eq!(*progress.batches.borrow(), 1);

    let zzz_key = partition::returns_key(Period::Daily, run_date(), "ZZZ");
    assert!(store.get(BUCKET, &zzz_key).is_err());

    let batches = invalid_batches(&store);
    assert_eq!(batches.len(), 1);
    assert_eq!(summary.invalid_batch_key.as_deref(), Some(batches[0].as_str()));
    let listed = read_invalid_tickers(&store.get(BUCKET, &batches[0]).unwrap()).unwrap();
    assert_eq!(listed, ["ZZZ"]);
}

#[test]
fn uploaded_table_has_returns_in_date_order() {
    let fetcher = fetcher(ScriptedApi::default().reply("IBM", Ok(daily_body())));
    let store = MemoryObjectStore::new();
    let mut ctx = RunContext::new(&fetcher, &store, BUCKET, Period::Daily, run_date(), pool(1))
        .with_clock(fixed_clock);

    run_downloads(&mut ctx, &tickers(&["ibm"]), &RecordingProgress::default()).unwrap();

    let key = partition::returns_key(Period::Daily, run_date(), "IBM");
    let table = read_returns_csv(&store.get(BUCKET, &key).unwrap()).unwrap();
    assert_eq!(table.ticker, "IBM");
    assert_eq!(table.len(), 3);

    let dates: Vec<_> = table.rows.iter().map(|r| r.date.to_string()).collect();
    assert_eq!(dates, ["2020-05-27", "2020-05-28", "2020-05-29"]);
    assert!(table.rows.iter().all(|r| r.download_timestamp == "2020-05-29 18:30:00"));

    assert_eq!(table.rows[0].total_return, None);
    // 99/98 - 1 plus a 1.00 dividend on a 100.00 close
    let r1 = table.rows[1].total_return.unwrap();
    assert!((r1 - (99.0 / 98.0 - 1.0 + 0.01)).abs() < 1e-12);
    assert!((table.rows[1].dividend_yield.unwrap() - 0.01).abs() < 1e-12);
    let r2 = table.rows[2].total_return.unwrap();
    assert!((r2 - (100.0 / 99.0 - 1.0)).abs() < 1e-12);
}

#[test]
fn queue_entries_are_upper_cased_before_use() {
    let api = ScriptedApi::default().reply("ZZZ", Ok(error_body()));
    let fetcher = fetcher(api);
    let store = MemoryObjectStore::new();
    let progress = RecordingProgress::default();
    let mut ctx = RunContext::new(&fetcher, &store, BUCKET, Period::Daily, run_date(), pool(1))
        .with_clock(fixed_clock);

    let summary =
        run_downloads(&mut ctx, &tickers(&[" zzz ", "msft"]), &progress).unwrap();

    // the scripted reply is keyed by "ZZZ"; a lowercase request would get a quota notice
    assert_eq!(summary.invalid, 1);
    assert!(summary.exhausted);
    assert_eq!(summary.abandoned, ["MSFT"]);
    assert_eq!(*progress.started.borrow(), ["ZZZ", "MSFT"]);

    let batches = invalid_batches(&store);
    assert_eq!(batches.len(), 1);
    let listed = read_invalid_tickers(&store.get(BUCKET, &batches[0]).unwrap()).unwrap();
    assert_eq!(listed, ["ZZZ"]);
}

#[test]
fn exhaustion_stops_run_and_flushes_once() {
    // two keys: IBM gets quota notices on both, which exhausts the pool
    let api = ScriptedApi::default()
        .reply("AAPL", Ok(daily_body()))
        .reply("BAD", Ok(error_body()));
    let fetcher = fetcher(api);
    let store = MemoryObjectStore::new();
    let progress = RecordingProgress::default();
    let mut ctx = RunContext::new(&fetcher, &store, BUCKET, Period::Daily, run_date(), pool(2))
        .with_clock(fixed_clock);

    let summary = run_downloads(
        &mut ctx,
        &tickers(&["AAPL", "BAD", "IBM", "MSFT"]),
        &progress,
    )
    .unwrap();

    assert!(summary.exhausted);
    assert!(!summary.completed());
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.invalid, 1);
    assert_eq!(summary.abandoned, ["IBM", "MSFT"]);
    assert!(ctx.pool.is_exhausted());

    // MSFT was never attempted
    assert_eq!(*progress.started.borrow(), ["AAPL", "BAD", "IBM"]);
    assert_eq!(*progress.batches.borrow(), 1);
    assert_eq!(invalid_batches(&store).len(), 1);
    assert!(ctx.invalid.is_empty());
    // one returns object plus one invalid batch
    assert_eq!(store.len(), 2);
}

#[test]
fn transport_failure_is_counted_but_not_marked_invalid() {
    let api = ScriptedApi::default()
        .reply("IBM", Err(TransportError::Timeout("slow".into())))
        .reply("IBM", Err(TransportError::Network("reset".into())))
        .reply("MSFT", Ok(daily_body()));
    let fetcher = fetcher(api);
    let store = MemoryObjectStore::new();
    let mut ctx = RunContext::new(&fetcher, &store, BUCKET, Period::Daily, run_date(), pool(1))
        .with_clock(fixed_clock);

    let summary =
        run_downloads(&mut ctx, &tickers(&["IBM", "MSFT"]), &RecordingProgress::default()).unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.invalid, 0);
    assert_eq!(summary.invalid_batch_key, None);
    assert!(invalid_batches(&store).is_empty());
    assert_eq!(ctx.pool.current_index(), 0);
}

#[test]
fn empty_queue_writes_nothing() {
    let fetcher = fetcher(ScriptedApi::default());
    let store = MemoryObjectStore::new();
    let progress = RecordingProgress::default();
    let mut ctx = RunContext::new(&fetcher, &store, BUCKET, Period::Monthly, run_date(), pool(1));

    let summary = run_downloads(&mut ctx, &[], &progress).unwrap();
    assert_eq!(summary, RunSummary::default());
    assert!(store.is_empty());
    assert_eq!(*progress.batches.borrow(), 1);
}

#[test]
fn second_run_resumes_and_skips_known_bad() {
    let store = MemoryObjectStore::new();
    let request = ResolveRequest {
        index_ticker: "IWV".into(),
        period: Period::Daily,
        run_date: run_date(),
        overwrite: false,
        exclude_known_bad: true,
    };

    // first run: AAPL uploads, BAD is invalid, then the single key runs dry
    let holdings = CsvHoldingsTable::from_reader(HOLDINGS.as_bytes()).unwrap();
    let queue = resolve_download_list(&holdings, &store, BUCKET, &request).unwrap();
    assert_eq!(queue, ["AAPL", "BAD", "IBM", "MSFT"]);

    let api = ScriptedApi::default()
        .reply("AAPL", Ok(daily_body()))
        .reply("BAD", Ok(error_body()));
    let first = fetcher(api);
    let mut ctx = RunContext::new(&first, &store, BUCKET, Period::Daily, run_date(), pool(1))
        .with_clock(fixed_clock);
    let summary = run_downloads(&mut ctx, &queue, &RecordingProgress::default()).unwrap();
    assert!(summary.exhausted);
    assert_eq!(summary.abandoned, ["IBM", "MSFT"]);

    // second run picks up only what is left
    let known_bad = KnownBadRegistry::from_store(&store, BUCKET).unwrap();
    assert!(known_bad.contains("BAD"));
    let holdings = CsvHoldingsTable::from_reader(HOLDINGS.as_bytes())
        .unwrap()
        .with_known_bad(known_bad);
    let queue = resolve_download_list(&holdings, &store, BUCKET, &request).unwrap();
    assert_eq!(queue, ["IBM", "MSFT"]);

    let api = ScriptedApi::default()
        .reply("IBM", Ok(daily_body()))
        .reply("MSFT", Ok(daily_body()));
    let second = fetcher(api);
    let mut ctx = RunContext::new(&second, &store, BUCKET, Period::Daily, run_date(), pool(1))
        .with_clock(fixed_clock);
    let summary = run_downloads(&mut ctx, &queue, &RecordingProgress::default()).unwrap();
    assert!(summary.completed());
    assert_eq!(summary.uploaded, 2);

    // a third resolve finds nothing to do
    let queue = resolve_download_list(&holdings, &store, BUCKET, &request).unwrap();
    assert!(queue.is_empty());
}
