//! Per-host rate limiting shared across downloads.
//!
//! Every origin host gets one [`HostLimiter`] tracking its 429 streak and a
//! block deadline. Limiters are handed out by a [`LimiterRegistry`] so that
//! two downloads hitting the same host observe the same block: when the
//! first one is told to back off, the second waits too instead of making
//! things worse.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

/// Ceiling for the exponential backoff path.
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Fractional jitter applied to every computed wait.
const WAIT_JITTER_FRAC: f64 = 0.10;

/// Perturbs `base` uniformly within `[base*(1-frac), base*(1+frac)]`.
///
/// Randomness comes from the thread-local OS-seeded generator, so
/// concurrent workers backing off after a shared failure spread out
/// instead of stampeding the server in lockstep.
pub fn add_jitter(base: Duration, frac: f64) -> Duration {
    let base_secs = base.as_secs_f64();
    let spread = base_secs * frac;
    if spread <= 0.0 {
        return base;
    }
    let secs = rand::thread_rng().gen_range((base_secs - spread)..=(base_secs + spread));
    Duration::from_secs_f64(secs.max(0.0))
}

/// Minimal view of a 429 response: the limiter only needs header access,
/// so tests can drive it with a bare header map.
pub trait RetryHeaders {
    fn header(&self, name: &str) -> Option<&str>;
}

impl RetryHeaders for reqwest::header::HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }
}

impl RetryHeaders for reqwest::Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers().header(name)
    }
}

/// Parses a `Retry-After` value: either non-negative integer seconds or an
/// RFC 1123 HTTP-date (always UTC). A date in the past yields zero; a
/// negative integer or garbage yields `None` so the caller falls through
/// to exponential backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        return Some(Duration::from_secs(seconds as u64));
    }

    match httpdate::parse_http_date(value) {
        Ok(when) => Some(
            when.duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        ),
        Err(_) => {
            debug!(value, "unparseable Retry-After value");
            None
        }
    }
}

struct LimiterState {
    /// Consecutive 429 responses since the last success.
    consecutive_429: u32,
    /// Deadline before which no request should be sent. `None` means never
    /// blocked.
    blocked_until: Option<Instant>,
}

/// Rate-limit state for a single origin host.
///
/// All methods are callable from any worker; the internal lock is only held
/// to read or update the two fields, never across a sleep.
pub struct HostLimiter {
    host: String,
    state: Mutex<LimiterState>,
}

impl HostLimiter {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(LimiterState {
                consecutive_429: 0,
                blocked_until: None,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Records a 429 response and returns how long the caller should wait.
    ///
    /// The wait is the server's `Retry-After` when present, otherwise
    /// `2^streak` seconds (pre-increment, capped), with ±10% jitter either
    /// way. The block deadline only ever moves forward: a short wait from a
    /// later 429 never truncates an earlier, longer block.
    pub fn handle_429<R: RetryHeaders>(&self, response: &R) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();

        let candidate = response
            .header("Retry-After")
            .and_then(parse_retry_after)
            .unwrap_or_else(|| {
                let exp = state.consecutive_429.min(9);
                Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
            });

        let wait = add_jitter(candidate, WAIT_JITTER_FRAC);
        let deadline = now + wait;
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) => existing.max(deadline),
            None => deadline,
        });
        state.consecutive_429 += 1;

        warn!(
            host = %self.host,
            wait_ms = wait.as_millis() as u64,
            streak = state.consecutive_429,
            "rate limited, backing off"
        );
        wait
    }

    /// Resets the 429 streak. The block deadline is left alone: one request
    /// getting through does not mean the server retracted the block.
    pub fn report_success(&self) {
        self.state.lock().consecutive_429 = 0;
    }

    pub fn is_blocked(&self) -> bool {
        self.state
            .lock()
            .blocked_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Sleeps until the block deadline if one is in the future. Returns
    /// whether it slept. The deadline is copied out before sleeping so no
    /// lock is held while other workers consult the limiter.
    pub async fn wait_if_blocked(&self) -> bool {
        let deadline = self.state.lock().blocked_until;
        let Some(until) = deadline else {
            return false;
        };
        let now = Instant::now();
        if now >= until {
            return false;
        }
        let wait = until - now;
        debug!(host = %self.host, wait_ms = wait.as_millis() as u64, "host blocked, waiting");
        tokio::time::sleep(wait).await;
        true
    }
}

/// Extracts the rate-limit key from a URL: the lowercase host, no port.
/// Malformed URLs all share the `"unknown"` key so they are still limited.
pub fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Process-wide mapping from host to [`HostLimiter`].
///
/// The registry owns the limiters; callers get shared handles that live as
/// long as the registry entry. Tests should construct their own registry
/// rather than touching [`LimiterRegistry::global`].
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<HostLimiter>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared default instance for callers that don't carry their own.
    pub fn global() -> &'static LimiterRegistry {
        static GLOBAL: OnceLock<LimiterRegistry> = OnceLock::new();
        GLOBAL.get_or_init(LimiterRegistry::new)
    }

    /// Returns the limiter for `host`, creating it on first access. The
    /// get-or-create is a single critical section on the map shard, so
    /// concurrent first-time lookups converge on one instance.
    pub fn limiter(&self, host: &str) -> Arc<HostLimiter> {
        let key = host.to_ascii_lowercase();
        self.limiters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(HostLimiter::new(key)))
            .clone()
    }

    /// Limiter for the host of `url`.
    pub fn limiter_for_url(&self, url: &str) -> Arc<HostLimiter> {
        self.limiter(&host_of(url))
    }

    /// Number of distinct hosts seen since the last [`reset`](Self::reset).
    pub fn active_hosts(&self) -> usize {
        self.limiters.len()
    }

    /// Drops all limiters. Intended for tests.
    pub fn reset(&self) {
        self.limiters.clear();
    }
}
