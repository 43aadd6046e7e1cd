// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP GET with bounded retry for the rate-limited upstream.
//!
//! Retries happen on 429, on any 5xx, and on transport failures. The delay
//! before each retry is taken, in order of preference, from the `Retry-After`
//! header, from an "available in N seconds" hint in the error body, or from
//! exponential backoff with jitter. Every delay is capped at
//! [`RetryConfig::max_delay`], and the whole sequence is bounded by
//! [`RetryConfig::budget`].
//!
//! When retries run out, the last HTTP response is handed back even if it is
//! not a success; only transport failures surface as errors.

use std::time::{Duration, Instant};

use bytes::Bytes;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryConfig;

lazy_static! {
    static ref AVAILABLE_IN: Option<Regex> =
        Regex::new(r"(?i)Expected available in\s+(\d+)\s+seconds").ok();
}

#[derive(Debug, Error)]
pub enum HttpError {
    /// Connection reset, DNS, TLS, or timeout.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The retry budget ran out while an attempt was still in flight.
    #[error("retry budget of {0:?} exhausted before the upstream answered")]
    BudgetExhausted(Duration),
    #[error("invalid url {0:?}")]
    InvalidUrl(String),
    #[error("invalid header {0}")]
    InvalidHeader(String),
}

/// Status, headers, and fully buffered body of one upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Text of the `error` or `message` field of a JSON error body.
    pub fn error_message(&self) -> Option<String> {
        let body = self.json()?;
        ["error", "message"].iter().find_map(|field| {
            body.get(field)
                .and_then(|value| value.as_str())
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        })
    }
}

/// Only throttling and server-side failures are worth another attempt.
pub fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Parses the seconds out of a throttling message such as
/// `"Request was throttled. Expected available in 12 seconds."`.
pub fn parse_available_in(message: &str) -> Option<u64> {
    AVAILABLE_IN
        .as_ref()?
        .captures(message)
        .and_then(|captures| captures.get(1))
        .and_then(|seconds| seconds.as_str().parse().ok())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            // Whole seconds only; a fractional part is dropped.
            let value = value.trim();
            let end = value
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(value.len());
            value[..end].parse().ok()
        })
}

/// Delay computation shared by every retry sequence.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry that follows attempt number `attempt` (0-based).
    ///
    /// `jitter` is the random component and is clamped to the configured
    /// jitter bound, so callers (and tests) may pass any value.
    pub fn delay_for(
        &self,
        attempt: u32,
        retry_after_secs: Option<u64>,
        body_hint_secs: Option<u64>,
        jitter: Duration,
    ) -> Duration {
        let max = self.config.max_delay;
        if let Some(seconds) = retry_after_secs.or(body_hint_secs) {
            return Duration::from_secs(seconds).min(max);
        }
        // 2^31 already overflows any sane cap, keep the shift in range.
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        let backoff = self.config.base_delay.saturating_mul(factor);
        let jitter = jitter.min(self.config.jitter.saturating_sub(Duration::from_millis(1)));
        backoff.saturating_add(jitter).min(max)
    }

    fn delay_after_response(&self, attempt: u32, response: &HttpResponse) -> Duration {
        let hint = response
            .error_message()
            .and_then(|message| parse_available_in(&message));
        self.delay_for(
            attempt,
            parse_retry_after(&response.headers),
            hint,
            self.sample_jitter(),
        )
    }

    fn sample_jitter(&self) -> Duration {
        let bound = self.config.jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..bound))
    }
}

/// Attempt counter and elapsed time of one retry sequence.
#[derive(Debug)]
pub struct RetryState {
    pub attempt: u32,
    started: Instant,
    max_retries: u32,
    budget: Duration,
}

impl RetryState {
    pub fn new(config: &RetryConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    pub fn starting_at(config: &RetryConfig, started: Instant) -> Self {
        Self {
            attempt: 0,
            started,
            max_retries: config.max_retries,
            budget: config.budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left in the budget.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Whether another attempt may start after sleeping for `delay`. The
    /// attempt limit and the wall-clock budget are checked together and
    /// whichever runs out first ends the sequence.
    pub fn may_retry_after(&self, delay: Duration) -> bool {
        self.permits(self.elapsed(), delay)
    }

    fn permits(&self, elapsed: Duration, delay: Duration) -> bool {
        self.attempt < self.max_retries && elapsed.saturating_add(delay) < self.budget
    }
}

/// Issues GET requests with the retry policy above.
#[derive(Debug, Clone)]
pub struct RetryingHttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl RetryingHttpClient {
    pub fn new(config: RetryConfig) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(HttpError::Transport)?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: RetryConfig) -> Self {
        Self {
            client,
            policy: RetryPolicy::new(config),
        }
    }

    pub async fn request(&self, url: &str, headers: &HeaderMap) -> Result<HttpResponse, HttpError> {
        let mut state = RetryState::new(self.policy.config());
        let mut previous: Option<HttpResponse> = None;

        loop {
            let attempt = match self.attempt(url, headers, &state).await {
                Err(HttpError::BudgetExhausted(budget)) if previous.is_some() => {
                    warn!(
                        "Retry budget of {budget:?} ran out during attempt {} for {url}, returning previous response",
                        state.attempt + 1
                    );
                    return previous.ok_or(HttpError::BudgetExhausted(budget));
                }
                other => other,
            };

            let delay = match &attempt {
                Ok(response) if should_retry(response.status) => {
                    Some(self.policy.delay_after_response(state.attempt, response))
                }
                Ok(_) => None,
                Err(_) => Some(self.policy.delay_for(
                    state.attempt,
                    None,
                    None,
                    self.policy.sample_jitter(),
                )),
            };
            let Some(delay) = delay else {
                break attempt;
            };

            if !state.may_retry_after(delay) {
                if let Err(e) = &attempt {
                    warn!(
                        "Giving up on {url} after {} attempts and {} ms: {e}",
                        state.attempt + 1,
                        state.elapsed().as_millis()
                    );
                } else {
                    warn!(
                        "Giving up on {url} after {} attempts and {} ms, returning last response",
                        state.attempt + 1,
                        state.elapsed().as_millis()
                    );
                }
                break attempt;
            }

            match &attempt {
                Ok(response) => debug!(
                    "Attempt {} for {url} returned {}, retrying in {} ms",
                    state.attempt + 1,
                    response.status,
                    delay.as_millis()
                ),
                Err(e) => debug!(
                    "Attempt {} for {url} failed: {e}, retrying in {} ms",
                    state.attempt + 1,
                    delay.as_millis()
                ),
            }
            if let Ok(response) = attempt {
                previous = Some(response);
            }
            tokio::time::sleep(delay).await;
            state.attempt += 1;
        }
    }

    async fn attempt(
        &self,
        url: &str,
        headers: &HeaderMap,
        state: &RetryState,
    ) -> Result<HttpResponse, HttpError> {
        let send = async {
            let response = self.client.get(url).headers(headers.clone()).send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, HttpError>(HttpResponse {
                status,
                headers,
                body,
            })
        };
        if state.attempt == 0 {
            return send.await;
        }
        // Retries must not outlive the budget.
        let budget = self.policy.config().budget;
        tokio::time::timeout(state.remaining(), send)
            .await
            .map_err(|_| HttpError::BudgetExhausted(budget))?
    }
}

/// Builds a header map from name/value pairs.
pub fn header_map<'a, I>(pairs: I) -> Result<HeaderMap, HttpError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HttpError::InvalidHeader(name.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| HttpError::InvalidHeader(name.as_str().to_string()))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Returns a redacted view of request headers suitable for debug logging.
pub fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 2] = ["authorization", "x-api-key"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}
