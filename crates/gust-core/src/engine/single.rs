//! Whole-body fallback downloader.
//!
//! Used when the server offers no byte ranges, hides the resource size, or
//! the file is too small to be worth splitting. Streams one response into
//! the partial file and renames it on success. Unlike the concurrent
//! engine it does not retry mid-transfer: a truncated body surfaces the
//! underlying error and leaves the partial file for inspection.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gust_types::{EngineEvent, Phase, RuntimeConfig};

use crate::engine::{build_http_client, partial_path, PROGRESS_BATCH};
use crate::error::{GustError, RateLimitError};
use crate::limiter::{host_of, LimiterRegistry};
use crate::progress::ProgressState;

/// Single-stream downloader for servers without range support.
pub struct SingleDownloader {
    id: String,
    client: Client,
    state: Option<Arc<ProgressState>>,
    runtime: RuntimeConfig,
    registry: Arc<LimiterRegistry>,
    events: Option<broadcast::Sender<EngineEvent>>,
}

impl SingleDownloader {
    /// A missing progress state is tolerated: the downloader simply does
    /// not publish counters.
    pub fn new(
        id: impl Into<String>,
        client: Option<Client>,
        state: Option<Arc<ProgressState>>,
        runtime: RuntimeConfig,
    ) -> Result<Self, GustError> {
        let client = match client {
            Some(client) => client,
            None => build_http_client(&runtime)?,
        };
        Ok(Self::from_parts(
            id.into(),
            client,
            state,
            runtime,
            Arc::new(LimiterRegistry::new()),
        ))
    }

    pub(crate) fn from_parts(
        id: String,
        client: Client,
        state: Option<Arc<ProgressState>>,
        runtime: RuntimeConfig,
        registry: Arc<LimiterRegistry>,
    ) -> Self {
        Self {
            id,
            client,
            state,
            runtime,
            registry,
            events: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<LimiterRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Streams `url` into `dest_path`. `filename` is only used for logs.
    pub async fn download(
        &self,
        cancel: CancellationToken,
        url: &str,
        dest_path: &Path,
        total: u64,
        filename: &str,
        _resume: bool,
    ) -> Result<(), GustError> {
        info!(id = %self.id, url, filename, "starting single-stream download");
        if let Some(state) = &self.state {
            state.set_phase(Phase::Running);
        }
        self.emit(EngineEvent::Started {
            id: self.id.clone(),
            filename: filename.to_string(),
            total,
            url: url.to_string(),
            dest_path: dest_path.to_path_buf(),
        });

        let result = self.run(&cancel, url, dest_path, total).await;

        match &result {
            Ok(()) => {
                if let Some(state) = &self.state {
                    state.set_phase(Phase::Completed);
                }
                self.emit(EngineEvent::Completed { id: self.id.clone() });
                info!(id = %self.id, filename, "single-stream download complete");
            }
            Err(e) => {
                if let Some(state) = &self.state {
                    state.set_phase(Phase::Failed);
                }
                self.emit(EngineEvent::Failed {
                    id: self.id.clone(),
                    error: e.to_string(),
                });
                warn!(id = %self.id, filename, error = %e, "single-stream download failed");
            }
        }
        result
    }

    pub(crate) async fn run(
        &self,
        cancel: &CancellationToken,
        url: &str,
        dest_path: &Path,
        total: u64,
    ) -> Result<(), GustError> {
        let limiter = self.registry.limiter(&host_of(url));
        limiter.wait_if_blocked().await;

        let mut response = self.client.get(url).send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            // One courtesy retry after the limiter wait; a second 429 is
            // the server's final word.
            let wait = limiter.handle_429(&response);
            warn!(id = %self.id, wait_ms = wait.as_millis() as u64, "rate limited, retrying once");
            tokio::time::sleep(wait).await;

            response = self.client.get(url).send().await?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                let wait = limiter.handle_429(&response);
                return Err(RateLimitError { wait }.into());
            }
        }
        let status = response.status();
        if !status.is_success() {
            return Err(GustError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        limiter.report_success();

        let total = match response.content_length() {
            Some(len) if len > 0 => len,
            _ => total,
        };
        if let Some(state) = &self.state {
            if total > 0 {
                state.set_total(total);
            }
        }

        if let Some(parent) = dest_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let partial = partial_path(dest_path, self.runtime.suffix());
        let mut file = File::create(&partial).await?;

        let mut written = 0u64;
        let mut unpublished = 0u64;
        let mut stream = response.bytes_stream();
        let result: Result<(), GustError> = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(GustError::Cancelled),
                next = stream.next() => next,
            };
            let Some(item) = next else { break Ok(()) };
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => break Err(e.into()),
            };
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
            unpublished += bytes.len() as u64;
            if unpublished >= PROGRESS_BATCH {
                if let Some(state) = &self.state {
                    state.add_downloaded(unpublished);
                }
                unpublished = 0;
            }
        };
        if unpublished > 0 {
            if let Some(state) = &self.state {
                state.add_downloaded(unpublished);
            }
        }

        // Leave the partial file in place on any failure.
        result?;
        if total > 0 && written < total {
            return Err(GustError::RangeMismatch {
                expected: total,
                actual: written,
            });
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, dest_path).await?;
        Ok(())
    }
}
