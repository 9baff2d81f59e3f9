// src/ingest/fetcher.rs
//! Rate-limited HTTP fetcher: one instance (and one `RateLimitState`) per provider.
//!
//! Before each call the fetcher either waits out an exhausted quota
//! (`remaining < safety_threshold` and the reset lies in the future) or applies
//! a pessimistic fixed delay, shorter when the provider has confirmed plenty of
//! headroom. After each response the state is overwritten from quota headers;
//! a 429 forces `remaining = 0` with a provider default penalty window.
//!
//! A throttled call is reissued at most once, after one wait cycle. Anything
//! beyond that is the collector's decision.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, histogram};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Source of "now" in epoch milliseconds. Injectable for tests.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Provider-specific limits and header names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub provider: String,
    /// Optimistic starting quota before any header has been seen.
    pub initial_remaining: f64,
    /// Below this, wait for the reset instead of spending the last requests.
    pub safety_threshold: f64,
    /// Above this, the short safety delay applies.
    pub comfortable_remaining: f64,
    pub fast_delay_ms: u64,
    pub slow_delay_ms: u64,
    /// Added on top of the reported reset time.
    pub reset_buffer_ms: u64,
    /// Assumed penalty window when a 429 carries no reset information.
    pub throttle_penalty_ms: u64,
    /// Per-call timeout, distinct from quota waits.
    pub request_timeout_ms: u64,
    pub remaining_header: String,
    /// Header carrying seconds until the quota resets.
    pub reset_header: String,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            provider: "http".to_string(),
            initial_remaining: 600.0,
            safety_threshold: 2.0,
            comfortable_remaining: 50.0,
            fast_delay_ms: 600,
            slow_delay_ms: 1_500,
            reset_buffer_ms: 1_000,
            throttle_penalty_ms: 60_000,
            request_timeout_ms: 10_000,
            remaining_header: "x-ratelimit-remaining".to_string(),
            reset_header: "x-ratelimit-reset".to_string(),
        }
    }
}

impl RateLimitPolicy {
    pub fn named(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            ..Self::default()
        }
    }

    /// RapidAPI-hosted endpoints (the X/Twitter timeline proxy).
    pub fn rapidapi(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            fast_delay_ms: 800,
            slow_delay_ms: 1_500,
            remaining_header: "x-ratelimit-requests-remaining".to_string(),
            reset_header: "x-ratelimit-requests-reset".to_string(),
            ..Self::default()
        }
    }

    /// No artificial delays. Used by tests and local fixtures.
    pub fn unthrottled(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            fast_delay_ms: 0,
            slow_delay_ms: 0,
            reset_buffer_ms: 0,
            throttle_penalty_ms: 0,
            ..Self::default()
        }
    }
}

/// Mutable quota view for one provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitState {
    pub remaining: f64,
    pub reset_at_ms: i64,
}

/// What the fetcher will do before the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Quota exhausted: sleep until reset + buffer.
    QuotaReset(Duration),
    /// Pessimistic pacing delay.
    Safety(Duration),
}

impl Wait {
    pub fn duration(&self) -> Duration {
        match self {
            Wait::QuotaReset(d) | Wait::Safety(d) => *d,
        }
    }
}

impl RateLimitState {
    pub fn optimistic(policy: &RateLimitPolicy) -> Self {
        Self {
            remaining: policy.initial_remaining,
            reset_at_ms: 0,
        }
    }

    pub fn plan_wait(&self, now_ms: i64, policy: &RateLimitPolicy) -> Wait {
        if self.remaining < policy.safety_threshold && now_ms < self.reset_at_ms {
            let ms = (self.reset_at_ms - now_ms) as u64 + policy.reset_buffer_ms;
            return Wait::QuotaReset(Duration::from_millis(ms));
        }
        let ms = if self.remaining > policy.comfortable_remaining {
            policy.fast_delay_ms
        } else {
            policy.slow_delay_ms
        };
        Wait::Safety(Duration::from_millis(ms))
    }

    /// Overwrite from quota headers; absent headers leave the field untouched.
    pub fn observe_headers(&mut self, remaining: Option<f64>, reset_secs: Option<f64>, now_ms: i64) {
        if let Some(r) = remaining {
            self.remaining = r;
        }
        if let Some(s) = reset_secs {
            self.reset_at_ms = now_ms + (s * 1000.0).round() as i64;
        }
    }

    /// Explicit throttle signal. `reset_hint_ms` comes from Retry-After or the
    /// reset header when the provider sent one.
    pub fn observe_throttle(&mut self, now_ms: i64, reset_hint_ms: Option<i64>, policy: &RateLimitPolicy) {
        self.remaining = 0.0;
        self.reset_at_ms = match reset_hint_ms {
            Some(at) if at > now_ms => at,
            _ => now_ms + policy.throttle_penalty_ms as i64,
        };
    }
}

/// A single GET against an upstream.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }
}

pub struct RateLimitedFetcher {
    http: reqwest::Client,
    policy: RateLimitPolicy,
    state: Mutex<RateLimitState>,
    clock: Clock,
}

impl RateLimitedFetcher {
    pub fn new(policy: RateLimitPolicy) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent("crypto-pulse/0.1 (server-side collector)")
            .connect_timeout(Duration::from_secs(4))
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;
        Ok(Self::with_client(http, policy))
    }

    pub fn with_client(http: reqwest::Client, policy: RateLimitPolicy) -> Self {
        let state = RateLimitState::optimistic(&policy);
        Self {
            http,
            policy,
            state: Mutex::new(state),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_state(self, state: RateLimitState) -> Self {
        *self.lock_state() = state;
        self
    }

    pub fn provider(&self) -> &str {
        &self.policy.provider
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn state(&self) -> RateLimitState {
        *self.lock_state()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RateLimitState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Suspend until the next request may be issued. Returns the time waited.
    pub async fn acquire(&self) -> Duration {
        let now = (self.clock)();
        let wait = self.lock_state().plan_wait(now, &self.policy);
        if let Wait::QuotaReset(d) = wait {
            warn!(
                provider = %self.policy.provider,
                wait_ms = d.as_millis() as u64,
                "quota exhausted, waiting for reset"
            );
        }
        let d = wait.duration();
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
        histogram!("fetch_wait_ms", "provider" => self.policy.provider.clone())
            .record(d.as_secs_f64() * 1_000.0);
        d
    }

    /// Issue one GET, respecting the provider quota, and return the JSON body.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        let mut reissued = false;
        loop {
            self.acquire().await;

            let mut rb = self
                .http
                .get(&request.url)
                .timeout(Duration::from_millis(self.policy.request_timeout_ms));
            if !request.query.is_empty() {
                rb = rb.query(&request.query);
            }
            for (k, v) in &request.headers {
                rb = rb.header(k.as_str(), v.as_str());
            }

            let resp = rb.send().await.map_err(|e| self.map_send_error(e))?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let now = (self.clock)();
            let (remaining, reset_secs) = self.quota_headers(&headers);
            self.lock_state().observe_headers(remaining, reset_secs, now);

            if status == StatusCode::TOO_MANY_REQUESTS {
                counter!("fetch_rate_limited_total", "provider" => self.policy.provider.clone())
                    .increment(1);
                let hint = retry_after_secs(&headers)
                    .or(reset_secs)
                    .map(|s| now + (s * 1000.0).round() as i64);
                let retry_after_ms = {
                    let mut st = self.lock_state();
                    st.observe_throttle(now, hint, &self.policy);
                    (st.reset_at_ms - now).max(0) as u64
                };
                if !reissued {
                    reissued = true;
                    warn!(
                        provider = %self.policy.provider,
                        retry_after_ms,
                        "throttled (429), reissuing once after reset"
                    );
                    continue;
                }
                return Err(FetchError::RateLimited {
                    provider: self.policy.provider.clone(),
                    retry_after_ms,
                });
            }

            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }

            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_ascii_lowercase();
            let body = resp.text().await.map_err(|e| self.map_send_error(e))?;
            debug!(provider = %self.policy.provider, bytes = body.len(), "response received");
            return parse_json_body(&content_type, &body);
        }
    }

    fn quota_headers(&self, headers: &HeaderMap) -> (Option<f64>, Option<f64>) {
        (
            header_f64(headers, &self.policy.remaining_header),
            header_f64(headers, &self.policy.reset_header),
        )
    }

    fn map_send_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::NetworkTimeout(self.policy.request_timeout_ms)
        } else {
            FetchError::from(e)
        }
    }
}

/// Sniff content-type and leading character before handing the body to serde.
pub fn parse_json_body(content_type: &str, body: &str) -> Result<Value, FetchError> {
    let trimmed = body.trim_start_matches('\u{feff}').trim();
    if content_type.contains("html") || !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        let head: String = trimmed.chars().take(40).collect();
        return Err(FetchError::InvalidResponseFormat(format!(
            "expected JSON, got content-type {:?} starting with {:?}",
            content_type, head
        )));
    }
    serde_json::from_str(trimmed).map_err(|e| FetchError::InvalidResponseFormat(e.to_string()))
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn retry_after_secs(headers: &HeaderMap) -> Option<f64> {
    header_f64(headers, RETRY_AFTER.as_str())
}
