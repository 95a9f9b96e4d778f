//! gust-core — multi-connection download engine
//!
//! This crate fetches a single remote resource as fast as the network and
//! the origin permit:
//! - Per-host rate limiting honoring 429 / `Retry-After`, with exponential
//!   backoff, jitter, and success-reset, shared across downloads
//! - Concurrent range engine: chunk planning, a bounded worker pool
//!   writing disjoint regions of one pre-allocated partial file, resume
//! - Single-stream fallback for servers without range support
//! - Lock-free progress counter observers can poll at UI cadence
//!
//! Architecture:
//! - The probe (HEAD, then a one-byte ranged GET) picks the engine variant
//! - Workers retry transient failures locally; the engine aggregates and
//!   returns the first fatal error
//! - Rate-limit state lives in a process-wide registry keyed by host, so
//!   parallel downloads from one origin back off together

pub mod engine;
pub mod error;
pub mod limiter;
pub mod progress;

pub use engine::{
    build_http_client, plan_chunks, probe, ConcurrentDownloader, ResourceInfo, SingleDownloader,
};
pub use error::{GustError, RateLimitError};
pub use limiter::{add_jitter, host_of, HostLimiter, LimiterRegistry, RetryHeaders};
pub use progress::ProgressState;
