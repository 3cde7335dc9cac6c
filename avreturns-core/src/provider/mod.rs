//! Market-data provider: transport, response validation, and the per-ticker fetcher.

pub mod api;
pub mod fetcher;
pub mod response;

pub use api::{HttpApi, QueryParams, TimeSeriesApi, TransportError, DEFAULT_BASE_URL};
pub use fetcher::{FetchError, PriceFetcher, TickerRequest, MAX_TRANSPORT_RETRIES};
pub use response::{quota_note, Freshness, RawTimeSeries, ValidationFailure};
