//! Resource probing: size, range support, validators.
//!
//! A HEAD request answers most servers. CDNs that hide `Content-Length`
//! from HEAD (or reject HEAD outright) get a one-byte ranged GET instead,
//! which also doubles as the range-support test: a 206 settles it.

use reqwest::{header, Client, StatusCode};
use tracing::{debug, info};

use crate::error::GustError;

/// What the probe learned about the remote resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceInfo {
    /// Size in bytes, when the server reveals it.
    pub total: Option<u64>,
    /// True when the server advertises `Accept-Ranges: bytes` or answered
    /// a test range request with 206.
    pub ranges_supported: bool,
    /// Validator forwarded as `If-Match` on ranged requests.
    pub etag: Option<String>,
    /// Validator forwarded as `If-Unmodified-Since` on ranged requests.
    pub last_modified: Option<String>,
    /// URL after redirects, when it differs from the requested one.
    pub final_url: Option<String>,
}

fn header_str(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total size out of a `Content-Range` like `bytes 0-0/12345`. `*` means
/// the server itself does not know.
fn content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?;
    if total == "*" {
        return None;
    }
    total.trim().parse().ok()
}

/// Probes `url` to decide between the concurrent and single downloaders.
pub async fn probe(client: &Client, url: &str) -> Result<ResourceInfo, GustError> {
    let mut info = ResourceInfo::default();
    let mut head_ok = false;

    match client.head(url).send().await {
        Ok(response) if response.status().is_success() => {
            head_ok = true;
            info.ranges_supported = header_str(&response, header::ACCEPT_RANGES)
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
            // A zero Content-Length on HEAD usually describes the empty
            // HEAD body, not the resource; treat it as unknown.
            info.total = header_str(&response, header::CONTENT_LENGTH)
                .and_then(|v| v.parse().ok())
                .filter(|&len| len > 0);
            info.etag = header_str(&response, header::ETAG);
            info.last_modified = header_str(&response, header::LAST_MODIFIED);
            let final_url = response.url().to_string();
            if final_url != url {
                info.final_url = Some(final_url);
            }
        }
        Ok(response) => {
            debug!(status = %response.status(), "HEAD not usable, falling back to ranged GET");
        }
        Err(e) => {
            debug!(error = %e, "HEAD failed, falling back to ranged GET");
        }
    }

    if info.total.is_none() || !info.ranges_supported {
        let result = client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::PARTIAL_CONTENT {
                    info.ranges_supported = true;
                }
                if let Some(total) = header_str(&response, header::CONTENT_RANGE)
                    .as_deref()
                    .and_then(content_range_total)
                {
                    info.total = Some(total);
                } else if status == StatusCode::OK && info.total.is_none() {
                    // Server ignored the range and sent the whole body
                    info.total = header_str(&response, header::CONTENT_LENGTH)
                        .and_then(|v| v.parse().ok())
                        .filter(|&len| len > 0);
                    info.ranges_supported = false;
                }
                if info.etag.is_none() {
                    info.etag = header_str(&response, header::ETAG);
                }
                if info.last_modified.is_none() {
                    info.last_modified = header_str(&response, header::LAST_MODIFIED);
                }
                if info.final_url.is_none() {
                    let final_url = response.url().to_string();
                    if final_url != url {
                        info.final_url = Some(final_url);
                    }
                }
            }
            Err(e) if !head_ok => return Err(e.into()),
            Err(e) => {
                debug!(error = %e, "ranged probe failed, keeping HEAD results");
            }
        }
    }

    info!(
        total = ?info.total,
        ranges = info.ranges_supported,
        "probe complete"
    );
    Ok(info)
}
