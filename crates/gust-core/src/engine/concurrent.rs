//! Concurrent range downloader.
//!
//! Partitions the resource into chunks and drives a bounded worker pool.
//! Every worker streams its byte range into a disjoint region of a single
//! pre-allocated partial file, so completion is a rename instead of a
//! merge pass. Transient failures retry per chunk; 429 responses go
//! through the shared per-host limiter so parallel chunks (and parallel
//! downloads) back off together.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gust_types::{ChunkState, ChunkStatus, EngineEvent, Phase, RuntimeConfig};

use crate::engine::planner::plan_chunks;
use crate::engine::probe::probe;
use crate::engine::single::SingleDownloader;
use crate::engine::{build_http_client, partial_path, PROGRESS_BATCH};
use crate::error::{GustError, RateLimitError};
use crate::limiter::{add_jitter, host_of, HostLimiter, LimiterRegistry};
use crate::progress::ProgressState;

/// Base delay for transient-failure retries; doubles per attempt.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Transient-failure retries never sleep longer than this.
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Jitter fraction applied to transient-failure backoff.
const RETRY_JITTER_FRAC: f64 = 0.20;

/// Multi-connection downloader for a single resource.
pub struct ConcurrentDownloader {
    id: String,
    client: Client,
    state: Arc<ProgressState>,
    runtime: RuntimeConfig,
    registry: Arc<LimiterRegistry>,
    events: Option<broadcast::Sender<EngineEvent>>,
    paused: Arc<AtomicBool>,
}

impl ConcurrentDownloader {
    /// `client: None` means a default client with connection pooling and
    /// the configured per-request timeout.
    pub fn new(
        id: impl Into<String>,
        client: Option<Client>,
        state: Arc<ProgressState>,
        runtime: RuntimeConfig,
    ) -> Result<Self, GustError> {
        let client = match client {
            Some(client) => client,
            None => build_http_client(&runtime)?,
        };
        Ok(Self {
            id: id.into(),
            client,
            state,
            runtime,
            registry: Arc::new(LimiterRegistry::new()),
            events: None,
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shares a limiter registry with other downloads, typically
    /// [`LimiterRegistry::global`] or one owned by the caller.
    pub fn with_registry(mut self, registry: Arc<LimiterRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Flag distinguishing a pause from a hard cancel. Set it before
    /// cancelling the token to park the download in `Paused` instead of
    /// `Failed`.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Downloads `url` into `dest_path`.
    ///
    /// `total` is the expected size when the caller knows it (0 when it
    /// does not); the probe's answer wins when both exist. With
    /// `resume: true` and a populated chunk table in the progress state,
    /// finished chunks are skipped and the rest continue from their
    /// recorded `bytes_written`.
    pub async fn download(
        &self,
        cancel: CancellationToken,
        url: &str,
        dest_path: &Path,
        total: u64,
        resume: bool,
    ) -> Result<(), GustError> {
        let filename = dest_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        info!(id = %self.id, url, %filename, "starting download");
        self.state.set_phase(Phase::Running);
        self.emit(EngineEvent::Started {
            id: self.id.clone(),
            filename,
            total,
            url: url.to_string(),
            dest_path: dest_path.to_path_buf(),
        });

        let result = self.run(&cancel, url, dest_path, total, resume).await;

        match &result {
            Ok(()) => {
                self.state.set_phase(Phase::Completed);
                self.emit(EngineEvent::Completed { id: self.id.clone() });
                info!(id = %self.id, "download complete");
            }
            Err(GustError::Cancelled) if self.paused.load(Ordering::Acquire) => {
                self.state.set_phase(Phase::Paused);
                info!(id = %self.id, "download paused");
            }
            Err(e) => {
                self.state.set_phase(Phase::Failed);
                self.emit(EngineEvent::Failed {
                    id: self.id.clone(),
                    error: e.to_string(),
                });
                warn!(id = %self.id, error = %e, "download failed");
            }
        }
        result
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        url: &str,
        dest_path: &Path,
        total_hint: u64,
        resume: bool,
    ) -> Result<(), GustError> {
        self.registry.limiter(&host_of(url)).wait_if_blocked().await;
        let info = probe(&self.client, url).await?;
        let url = info.final_url.clone().unwrap_or_else(|| url.to_string());

        let total = info
            .total
            .or_else(|| (total_hint > 0).then_some(total_hint));

        let total = match total {
            Some(total) if info.ranges_supported && total > self.runtime.min_chunk() => total,
            _ => {
                debug!(
                    id = %self.id,
                    total = ?total,
                    ranges = info.ranges_supported,
                    "falling back to single-stream transfer"
                );
                let single = SingleDownloader::from_parts(
                    self.id.clone(),
                    self.client.clone(),
                    Some(self.state.clone()),
                    self.runtime.clone(),
                    self.registry.clone(),
                );
                return single.run(cancel, &url, dest_path, total.unwrap_or(0)).await;
            }
        };
        self.state.set_total(total);

        let partial = partial_path(dest_path, self.runtime.suffix());
        if let Some(parent) = dest_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Reuse the caller-restored chunk table only when it still
        // describes this resource and the partial file is present.
        let mut chunks = if resume { self.state.chunks() } else { Vec::new() };
        let resumable = !chunks.is_empty()
            && chunks.last().map(|c| c.end) == Some(total - 1)
            && tokio::fs::try_exists(&partial).await.unwrap_or(false);
        if !resumable {
            chunks = plan_chunks(total, &self.runtime);
        }
        for chunk in &mut chunks {
            if chunk.state != ChunkState::Done {
                chunk.state = ChunkState::Pending;
                chunk.attempt = 0;
            }
        }
        let already: u64 = chunks.iter().map(|c| c.bytes_written).sum();
        self.state.set_downloaded(already);
        self.state.set_chunks(chunks.clone());
        if resumable {
            info!(id = %self.id, bytes = already, "resuming from partial file");
        }

        // Pre-allocate so every worker writes into its own region.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&partial)
            .await?;
        if file.metadata().await?.len() != total {
            file.set_len(total).await?;
        }
        drop(file);

        let limiter = self.registry.limiter(&host_of(&url));
        let pending: Vec<ChunkStatus> = chunks
            .into_iter()
            .filter(|c| c.state != ChunkState::Done)
            .collect();
        let n_chunks = self.state.chunks().len();
        let pool_size = (self.runtime.connections() as usize)
            .min(pending.len())
            .max(1);
        let pool = Arc::new(Semaphore::new(pool_size));
        let inner_cancel = cancel.child_token();

        let mut workers = JoinSet::new();
        for chunk in pending {
            let worker = ChunkWorker {
                id: self.id.clone(),
                url: url.clone(),
                partial: partial.clone(),
                chunk,
                sole_chunk: n_chunks == 1,
                client: self.client.clone(),
                limiter: limiter.clone(),
                state: self.state.clone(),
                pool: pool.clone(),
                cancel: inner_cancel.clone(),
                max_retries: self.runtime.max_retries(),
                etag: info.etag.clone(),
                last_modified: info.last_modified.clone(),
            };
            workers.spawn(worker.run());
        }

        let mut failure: Option<GustError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        // First fatal error wins; stop the other workers.
                        inner_cancel.cancel();
                        failure = Some(e);
                    }
                }
                Err(join_error) => {
                    if failure.is_none() {
                        inner_cancel.cancel();
                        failure = Some(GustError::Worker(join_error.to_string()));
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(GustError::Cancelled);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let downloaded = self.state.downloaded();
        if downloaded != total {
            return Err(GustError::RangeMismatch {
                expected: total,
                actual: downloaded,
            });
        }

        let file = OpenOptions::new().write(true).open(&partial).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, dest_path).await?;
        Ok(())
    }
}

/// Outcome of one transfer attempt for a chunk, as seen by the retry loop.
enum ChunkError {
    /// Limiter already consulted; sleep this long before the next attempt.
    RateLimited(Duration),
    /// Worth retrying with backoff: 5xx, resets, short bodies.
    Transient(GustError),
    /// The server sent bytes outside the requested range. One retry.
    Invariant(GustError),
    /// Abort the chunk (and the download) immediately.
    Fatal(GustError),
}

struct ChunkWorker {
    id: String,
    url: String,
    partial: PathBuf,
    chunk: ChunkStatus,
    sole_chunk: bool,
    client: Client,
    limiter: Arc<HostLimiter>,
    state: Arc<ProgressState>,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
    max_retries: u32,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl ChunkWorker {
    async fn run(mut self) -> Result<(), GustError> {
        let index = self.chunk.index;
        debug!(
            id = %self.id,
            chunk = index,
            start = self.chunk.start,
            end = self.chunk.end,
            "chunk queued"
        );

        let mut invariant_strikes = 0u32;
        loop {
            // The permit is the pool slot: held while transferring,
            // released while sleeping so other chunks can run.
            let permit = tokio::select! {
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(GustError::Cancelled),
                },
                _ = self.cancel.cancelled() => return Err(GustError::Cancelled),
            };

            self.state
                .update_chunk(index, |c| c.state = ChunkState::Running);
            let outcome = self.attempt().await;
            drop(permit);

            let (wait, error) = match outcome {
                Ok(()) => {
                    self.chunk.state = ChunkState::Done;
                    self.publish_chunk();
                    self.limiter.report_success();
                    debug!(id = %self.id, chunk = index, "chunk complete");
                    return Ok(());
                }
                Err(ChunkError::Fatal(e)) => {
                    if !matches!(e, GustError::Cancelled) {
                        self.chunk.state = ChunkState::Failed;
                        self.publish_chunk();
                    }
                    return Err(e);
                }
                Err(ChunkError::RateLimited(wait)) => {
                    (wait, GustError::from(RateLimitError { wait }))
                }
                Err(ChunkError::Invariant(e)) => {
                    invariant_strikes += 1;
                    if invariant_strikes > 1 {
                        self.chunk.state = ChunkState::Failed;
                        self.publish_chunk();
                        return Err(e);
                    }
                    (Duration::ZERO, e)
                }
                Err(ChunkError::Transient(e)) => {
                    let exp = self.chunk.attempt.min(6) + 1; // next attempt number
                    let backoff = RETRY_BACKOFF_BASE * (1u32 << exp);
                    (add_jitter(backoff.min(RETRY_BACKOFF_CAP), RETRY_JITTER_FRAC), e)
                }
            };

            self.chunk.attempt += 1;
            if self.chunk.attempt > self.max_retries {
                self.chunk.state = ChunkState::Failed;
                self.publish_chunk();
                return Err(GustError::ChunkFailed {
                    index,
                    attempts: self.chunk.attempt,
                    source: Box::new(error),
                });
            }
            self.publish_chunk();

            warn!(
                id = %self.id,
                chunk = index,
                attempt = self.chunk.attempt,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "chunk attempt failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => return Err(GustError::Cancelled),
            }
        }
    }

    /// One transfer attempt: wait out any host block, issue the ranged GET
    /// from the current offset, and stream the body into place.
    async fn attempt(&mut self) -> Result<(), ChunkError> {
        tokio::select! {
            _ = self.limiter.wait_if_blocked() => {}
            _ = self.cancel.cancelled() => return Err(ChunkError::Fatal(GustError::Cancelled)),
        }

        let offset = self.chunk.start + self.chunk.bytes_written;
        if offset > self.chunk.end {
            return Ok(());
        }
        let expected = self.chunk.end - offset + 1;

        let mut request = self
            .client
            .get(&self.url)
            .header(header::RANGE, format!("bytes={}-{}", offset, self.chunk.end));
        if let Some(etag) = &self.etag {
            request = request.header(header::IF_MATCH, etag.clone());
        }
        if let Some(last_modified) = &self.last_modified {
            request = request.header(header::IF_UNMODIFIED_SINCE, last_modified.clone());
        }

        let response = tokio::select! {
            response = request.send() => response.map_err(|e| ChunkError::Transient(e.into()))?,
            _ = self.cancel.cancelled() => return Err(ChunkError::Fatal(GustError::Cancelled)),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = self.limiter.handle_429(&response);
            return Err(ChunkError::RateLimited(wait));
        }
        if status == StatusCode::OK {
            // The server ignored the range header. Tolerable only when this
            // chunk is the whole file starting at byte 0; anywhere else the
            // body would land in the wrong region.
            if offset != 0 || !self.sole_chunk {
                return Err(ChunkError::Fatal(GustError::RangeNotSupported {
                    url: self.url.clone(),
                }));
            }
        } else if status != StatusCode::PARTIAL_CONTENT {
            let code = status.as_u16();
            let error = GustError::Status {
                status: code,
                url: self.url.clone(),
            };
            if GustError::is_fatal_status(code) {
                return Err(ChunkError::Fatal(error));
            }
            return Err(ChunkError::Transient(error));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.partial)
            .await
            .map_err(|e| ChunkError::Fatal(e.into()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| ChunkError::Fatal(e.into()))?;

        let mut received = 0u64;
        let mut unpublished = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            // Cancellation checkpoint between buffers.
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.flush_progress(&mut unpublished);
                    return Err(ChunkError::Fatal(GustError::Cancelled));
                }
                next = stream.next() => next,
            };
            let Some(item) = next else { break };
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.flush_progress(&mut unpublished);
                    return Err(ChunkError::Transient(e.into()));
                }
            };

            let len = bytes.len() as u64;
            if received + len > expected {
                self.flush_progress(&mut unpublished);
                return Err(ChunkError::Invariant(GustError::RangeMismatch {
                    expected,
                    actual: received + len,
                }));
            }

            file.write_all(&bytes)
                .await
                .map_err(|e| ChunkError::Fatal(e.into()))?;
            received += len;
            self.chunk.bytes_written += len;
            unpublished += len;
            if unpublished >= PROGRESS_BATCH {
                self.flush_progress(&mut unpublished);
            }
        }
        self.flush_progress(&mut unpublished);
        file.flush().await.map_err(|e| ChunkError::Fatal(e.into()))?;

        if received < expected {
            return Err(ChunkError::Transient(GustError::RangeMismatch {
                expected,
                actual: received,
            }));
        }
        Ok(())
    }

    /// Publishes accumulated bytes to the shared counter and mirrors this
    /// chunk's progress into the shared table.
    fn flush_progress(&self, unpublished: &mut u64) {
        if *unpublished > 0 {
            self.state.add_downloaded(*unpublished);
            *unpublished = 0;
        }
        self.publish_chunk();
    }

    fn publish_chunk(&self) {
        let bytes_written = self.chunk.bytes_written;
        let attempt = self.chunk.attempt;
        let state = self.chunk.state;
        self.state.update_chunk(self.chunk.index, |c| {
            c.bytes_written = bytes_written;
            c.attempt = attempt;
            c.state = state;
        });
    }
}
