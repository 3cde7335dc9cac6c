//! Log setup: stderr always, plus a per-run file when a log directory is given.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `<log_dir>/avreturns_<YYYYmmddTHHMMSS>.log`
pub fn log_file_path(log_dir: &Path, started: NaiveDateTime) -> PathBuf {
    log_dir.join(format!("avreturns_{}.log", started.format("%Y%m%dT%H%M%S")))
}

/// Install the global subscriber. Returns the log file path, if any.
///
/// Level defaults to `info` and follows `RUST_LOG` when set.
pub fn init(log_dir: Option<&Path>, started: NaiveDateTime) -> Result<Option<PathBuf>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, path) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let path = log_file_path(dir, started);
            let file = File::create(&path)
                .with_context(|| format!("create log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("install log subscriber")?;

    Ok(path)
}
