//! Shared helpers for the engine integration tests: a range-serving mock
//! responder, a rate-limiting wrapper, and a raw TCP server that truncates
//! mid-transfer (something wiremock cannot fake).

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::{Request, Respond, ResponseTemplate};

pub fn random_body(len: usize) -> Vec<u8> {
    let mut body = vec![0u8; len];
    rand::thread_rng().fill(&mut body[..]);
    body
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        u64::MAX
    } else {
        end.parse().ok()?
    };
    Some((start, end))
}

/// Serves a fixed body, honoring `Range` requests with 206 responses when
/// `ranges` is true. Mount it for the `GET` method; HEAD probes falling
/// through to 404 are part of the scenario (CDNs reject HEAD too).
pub struct RangeResponder {
    body: Vec<u8>,
    ranges: bool,
    delay: Option<Duration>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ranges: true,
            delay: None,
        }
    }

    /// Plain 200 server: ignores `Range` and never advertises ranges.
    pub fn without_ranges(body: Vec<u8>) -> Self {
        Self {
            body,
            ranges: false,
            delay: None,
        }
    }

    /// Adds fixed latency to every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let template = match range {
            Some((start, end)) if self.ranges && start < total => {
                let end = end.min(total - 1);
                let slice = self.body[start as usize..=end as usize].to_vec();
                ResponseTemplate::new(206)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header(
                        "Content-Range",
                        format!("bytes {start}-{end}/{total}").as_str(),
                    )
                    .set_body_bytes(slice)
            }
            _ => {
                let template = ResponseTemplate::new(200).set_body_bytes(self.body.clone());
                if self.ranges {
                    template.insert_header("Accept-Ranges", "bytes")
                } else {
                    template
                }
            }
        };

        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// Answers 429 (with a `Retry-After`) for the first `fail_first` real
/// requests, then delegates to the inner responder. The one-byte probe
/// request is exempt so the engine still discovers size and range support.
pub struct RateLimitedResponder {
    inner: RangeResponder,
    fail_first: u32,
    retry_after: String,
    served: AtomicU32,
}

impl RateLimitedResponder {
    pub fn new(inner: RangeResponder, fail_first: u32, retry_after: &str) -> Self {
        Self {
            inner,
            fail_first,
            retry_after: retry_after.to_string(),
            served: AtomicU32::new(0),
        }
    }
}

impl Respond for RateLimitedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let is_probe = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "bytes=0-0");
        if !is_probe {
            let n = self.served.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return ResponseTemplate::new(429)
                    .insert_header("Retry-After", self.retry_after.as_str());
            }
        }
        self.inner.respond(request)
    }
}

/// One-shot HTTP server that claims `total` bytes, serves `serve` of them,
/// then drops the connection, producing a mid-transfer truncation.
pub async fn truncating_server(total: u64, serve: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut buf = [0u8; 4096];
            // Drain the request head; the response is the same regardless.
            let _ = socket.read(&mut buf).await;

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nContent-Type: application/octet-stream\r\n\r\n"
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                continue;
            }
            let body = random_body(serve);
            let _ = socket.write_all(&body).await;
            let _ = socket.flush().await;
            // Dropping the socket truncates the transfer.
        }
    });

    format!("http://{addr}/file.bin")
}
