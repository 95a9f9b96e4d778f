//! Shared progress state between the engine and its observers.
//!
//! The `downloaded` counter is the only hot field: workers bump it with an
//! atomic add after every flushed buffer and pollers read it at UI cadence
//! without taking a lock. Chunk statuses and the phase change rarely and
//! sit behind the state's own mutex.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use gust_types::{ChunkStatus, Phase, ProgressSnapshot};

struct Structured {
    phase: Phase,
    chunks: Vec<ChunkStatus>,
}

/// Live progress record for one download.
///
/// Created and owned by the caller, borrowed by the engine for the duration
/// of a `download` call. The engine and its workers are the only writers
/// while a transfer is running.
pub struct ProgressState {
    id: String,
    total: AtomicU64,
    downloaded: AtomicU64,
    structured: Mutex<Structured>,
}

impl ProgressState {
    pub fn new(id: impl Into<String>, total: u64) -> Self {
        Self {
            id: id.into(),
            total: AtomicU64::new(total),
            downloaded: AtomicU64::new(0),
            structured: Mutex::new(Structured {
                phase: Phase::Queued,
                chunks: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Set once the probe discovers the real size of an unknown-size body.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// Publishes freshly written bytes. Observers only ever see this value
    /// grow; retries continue from the bytes already on disk instead of
    /// rewinding the counter.
    pub fn add_downloaded(&self, delta: u64) {
        self.downloaded.fetch_add(delta, Ordering::AcqRel);
    }

    /// Re-baselines the counter when a download is resumed from existing
    /// partial bytes.
    pub fn set_downloaded(&self, value: u64) {
        self.downloaded.store(value, Ordering::Release);
    }

    pub fn phase(&self) -> Phase {
        self.structured.lock().phase
    }

    pub fn set_phase(&self, phase: Phase) {
        self.structured.lock().phase = phase;
    }

    /// Copy of the chunk table. Empty for single-stream downloads.
    pub fn chunks(&self) -> Vec<ChunkStatus> {
        self.structured.lock().chunks.clone()
    }

    /// Replaces the chunk table, e.g. when restoring persisted statuses
    /// before a resume.
    pub fn set_chunks(&self, chunks: Vec<ChunkStatus>) {
        self.structured.lock().chunks = chunks;
    }

    pub(crate) fn update_chunk(&self, index: u32, update: impl FnOnce(&mut ChunkStatus)) {
        let mut structured = self.structured.lock();
        if let Some(chunk) = structured.chunks.iter_mut().find(|c| c.index == index) {
            update(chunk);
        }
    }

    /// Point-in-time copy for rendering or persistence.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let structured = self.structured.lock();
        ProgressSnapshot {
            id: self.id.clone(),
            total: self.total(),
            downloaded: self.downloaded(),
            phase: structured.phase,
            chunks: structured.chunks.clone(),
        }
    }
}
