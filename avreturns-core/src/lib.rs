//! avreturns core: download full price histories for index constituents and
//! store total-return tables in a partitioned object store.
//!
//! - API-key pool with quota rotation and per-minute cooldowns
//! - Price fetcher with response validation
//! - Dividend-yield and total-return computation
//! - Download list resolution against existing uploads and known-bad tickers
//! - Returns and invalid-ticker sinks over an object-store interface

pub mod config;
pub mod holdings;
pub mod keys;
pub mod partition;
pub mod period;
pub mod pipeline;
pub mod provider;
pub mod resolver;
pub mod returns;
pub mod sink;
pub mod store;

pub use config::{ConfigError, Settings};
pub use keys::{KeyPool, Outcome, PoolError};
pub use period::Period;
pub use pipeline::{run_downloads, DownloadProgress, LogProgress, RunContext, RunSummary};
pub use provider::{FetchError, PriceFetcher};
pub use resolver::{resolve_download_list, ResolveRequest};
pub use store::{LocalObjectStore, MemoryObjectStore, ObjectStore};
