//! Shared types for gust
//!
//! This crate contains the data structures shared between the download
//! engine and its observers (UIs, CLIs, persistence layers). It carries no
//! runtime machinery: the hot counters and locks live in `gust-core`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Download phases
// ============================================================================

/// Coarse lifecycle phase of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl Phase {
    /// Whether the download has reached a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

// ============================================================================
// Chunks
// ============================================================================

/// State of a single byte-range chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Running,
    Done,
    Failed,
}

/// A contiguous byte range of the target resource assigned to one worker.
///
/// `start` and `end` are inclusive offsets into the resource. A chunk with
/// `bytes_written == size()` has been fully transferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStatus {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub bytes_written: u64,
    pub state: ChunkState,
    pub attempt: u32,
}

impl ChunkStatus {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            bytes_written: 0,
            state: ChunkState::Pending,
            attempt: 0,
        }
    }

    /// Total size of this chunk in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Bytes still missing from this chunk.
    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.bytes_written)
    }

    pub fn progress(&self) -> f64 {
        (self.bytes_written as f64 / self.size() as f64) * 100.0
    }
}

// ============================================================================
// Runtime configuration
// ============================================================================

/// Default worker pool size per origin host.
pub const DEFAULT_CONNECTIONS_PER_HOST: u32 = 4;
/// Default lower bound on chunk size (1 MiB).
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 1024 * 1024;
/// Default retry budget per chunk.
pub const DEFAULT_MAX_RETRIES_PER_CHUNK: u32 = 5;
/// Default suffix appended to the destination while a transfer is in flight.
pub const DEFAULT_PARTIAL_SUFFIX: &str = ".gust";

/// Tuning knobs for the download engine.
///
/// Zero values (and an empty suffix) mean "use the default", so a config can
/// be built by setting only the fields a caller cares about:
///
/// ```
/// use gust_types::RuntimeConfig;
///
/// let runtime = RuntimeConfig {
///     max_connections_per_host: 8,
///     ..Default::default()
/// };
/// assert_eq!(runtime.connections(), 8);
/// assert_eq!(runtime.min_chunk(), 1024 * 1024);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Upper bound on concurrent range requests against one host.
    pub max_connections_per_host: u32,
    /// Smallest chunk worth opening a connection for, in bytes.
    pub min_chunk_size: u64,
    /// How many times one chunk may be retried before the download fails.
    pub max_retries_per_chunk: u32,
    /// Per-request timeout applied to the HTTP client.
    pub request_timeout: Option<Duration>,
    /// Suffix appended to the destination path while the download is in flight.
    pub partial_suffix: String,
}

impl RuntimeConfig {
    pub fn connections(&self) -> u32 {
        if self.max_connections_per_host == 0 {
            DEFAULT_CONNECTIONS_PER_HOST
        } else {
            self.max_connections_per_host
        }
    }

    pub fn min_chunk(&self) -> u64 {
        if self.min_chunk_size == 0 {
            DEFAULT_MIN_CHUNK_SIZE
        } else {
            self.min_chunk_size
        }
    }

    pub fn max_retries(&self) -> u32 {
        if self.max_retries_per_chunk == 0 {
            DEFAULT_MAX_RETRIES_PER_CHUNK
        } else {
            self.max_retries_per_chunk
        }
    }

    pub fn suffix(&self) -> &str {
        if self.partial_suffix.is_empty() {
            DEFAULT_PARTIAL_SUFFIX
        } else {
            &self.partial_suffix
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Lifecycle events emitted by the engine to its observers.
///
/// The engine emits `Started` on entry and `Completed`/`Failed` on exit.
/// `Progress` is reserved for observers that poll the progress state and
/// re-broadcast it at their own cadence; the engine itself never sends it,
/// so the hot path stays free of channel traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    Started {
        id: String,
        filename: String,
        total: u64,
        url: String,
        dest_path: PathBuf,
    },
    Progress {
        id: String,
        downloaded: u64,
        total: u64,
    },
    Completed {
        id: String,
    },
    Failed {
        id: String,
        error: String,
    },
}

// ============================================================================
// Snapshots
// ============================================================================

/// Point-in-time copy of a download's progress, safe to serialize or hand
/// across threads without touching the live state again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub id: String,
    pub total: u64,
    pub downloaded: u64,
    pub phase: Phase,
    pub chunks: Vec<ChunkStatus>,
}

impl ProgressSnapshot {
    pub fn progress(&self) -> f64 {
        if self.total > 0 {
            (self.downloaded as f64 / self.total as f64) * 100.0
        } else {
            0.0
        }
    }
}
