//! Download engine: probe, plan, fetch.
//!
//! Two variants share one contract. The concurrent downloader partitions
//! the resource into byte ranges and drives a bounded worker pool; the
//! single downloader streams the whole body. The probe decides which one
//! runs.

mod concurrent;
mod planner;
mod probe;
mod single;

pub use concurrent::ConcurrentDownloader;
pub use planner::plan_chunks;
pub use probe::{probe, ResourceInfo};
pub use single::SingleDownloader;

use std::time::Duration;

use reqwest::Client;

use crate::error::GustError;
use gust_types::RuntimeConfig;

/// Progress deltas are published to the shared counter at least this often.
pub(crate) const PROGRESS_BATCH: u64 = 32 * 1024;

/// Builds the default HTTP client used when a caller passes none: pooled
/// connections, a connect timeout, and the configured per-request timeout.
pub fn build_http_client(runtime: &RuntimeConfig) -> Result<Client, GustError> {
    let mut builder = Client::builder()
        .user_agent(concat!("gust/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(runtime.connections() as usize);

    if let Some(timeout) = runtime.request_timeout {
        builder = builder.timeout(timeout);
    }

    Ok(builder.build()?)
}

/// Destination path with the in-flight suffix appended.
pub(crate) fn partial_path(dest: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(suffix);
    std::path::PathBuf::from(name)
}
