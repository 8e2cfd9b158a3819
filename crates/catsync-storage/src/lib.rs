//! Resilient outbound HTTP execution + snapshot persistence for catsync.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub mod memory;
pub mod store;

pub use memory::InMemorySnapshotStore;
pub use store::{PgSnapshotStore, SnapshotBatcher, SnapshotRow, SnapshotStore, StoreError};

pub const CRATE_NAME: &str = "catsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Network-level or transient upstream failure; exponential backoff.
    Transport,
    /// Explicit throttling signal; linear ramp plus jitter.
    RateLimited,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Transport
    } else {
        RetryDisposition::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Transport
    } else {
        RetryDisposition::Fatal
    }
}

/// Failure of a single attempt.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl CallError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            CallError::Request(err) => classify_reqwest_error(err),
            CallError::Transport(_) => RetryDisposition::Transport,
            CallError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Fatal),
            CallError::Decode { .. } => RetryDisposition::Fatal,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CallError::HttpStatus { status, .. } => Some(*status),
            CallError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// The only failure an executor caller has to handle.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{label}: gave up after {attempts} attempts: {last}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        last: CallError,
    },
    #[error("{label}: non-retryable failure on attempt {attempts}: {source}")]
    Fatal {
        label: String,
        attempts: u32,
        #[source]
        source: CallError,
    },
}

impl ExecError {
    pub fn attempts(&self) -> u32 {
        match self {
            ExecError::Exhausted { attempts, .. } | ExecError::Fatal { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, ExecError::Exhausted { .. })
    }

    pub fn last_error(&self) -> &CallError {
        match self {
            ExecError::Exhausted { last, .. } => last,
            ExecError::Fatal { source, .. } => source,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.last_error().status()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportBackoff {
    /// `base * 2^attempt_index`.
    Exponential { base: Duration },
    Fixed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub transport_backoff: TransportBackoff,
    pub rate_limit_step: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            transport_backoff: TransportBackoff::Exponential {
                base: Duration::from_secs(1),
            },
            rate_limit_step: Duration::from_secs(15),
            max_jitter: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy for public search catalogs that throttle with 403s: fixed 5s after
    /// transport errors, `(attempt+1)*15s + jitter` after a throttle.
    pub fn throttled_search() -> Self {
        Self {
            transport_backoff: TransportBackoff::Fixed(Duration::from_secs(5)),
            ..Self::default()
        }
    }

    /// Same attempt ceiling, no waiting at all.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            transport_backoff: TransportBackoff::Fixed(Duration::ZERO),
            rate_limit_step: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn transport_delay(&self, attempt_index: u32) -> Duration {
        match self.transport_backoff {
            TransportBackoff::Exponential { base } => {
                let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
            TransportBackoff::Fixed(delay) => delay,
        }
    }

    /// Deterministic part of the wait after a throttle on `attempt_index` (0-based).
    pub fn rate_limit_floor(&self, attempt_index: u32) -> Duration {
        self.rate_limit_step
            .saturating_mul(attempt_index.saturating_add(1))
    }

    pub fn rate_limit_delay(&self, attempt_index: u32) -> Duration {
        self.rate_limit_floor(attempt_index) + jitter(self.max_jitter)
    }

    pub fn delay_for(&self, disposition: RetryDisposition, attempt_index: u32) -> Option<Duration> {
        match disposition {
            RetryDisposition::Transport => Some(self.transport_delay(attempt_index)),
            RetryDisposition::RateLimited => Some(self.rate_limit_delay(attempt_index)),
            RetryDisposition::Fatal => None,
        }
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::rng().random_range(0.0..max.as_secs_f64()))
}

/// Runs `op` until it succeeds, fails fatally, or the policy's attempt ceiling is hit.
/// `op` receives the 0-based attempt index.
pub async fn execute_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ExecError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let attempts = attempt + 1;

        let Some(delay) = policy.delay_for(err.disposition(), attempt) else {
            return Err(ExecError::Fatal {
                label: label.to_string(),
                attempts,
                source: err,
            });
        };

        if attempts >= max_attempts {
            warn!(label, attempts, error = %err, "outbound call exhausted retries");
            return Err(ExecError::Exhausted {
                label: label.to_string(),
                attempts,
                last: err,
            });
        }

        warn!(
            label,
            attempt = attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "outbound call failed; backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            proxy_url: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// reqwest client bound to a retry policy.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpExecutor {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("parsing proxy url {proxy_url}"))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            policy: config.retry,
        })
    }

    /// Shares the connection pool under a different retry policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            client: self.client.clone(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Sends the request built by `build` (rebuilt for every attempt) and returns the
    /// first 2xx response.
    pub async fn send<F>(&self, label: &str, build: F) -> Result<reqwest::Response, ExecError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("outbound", label);
        execute_with_retries(&self.policy, label, |_| {
            let request = build(&self.client);
            async move { success_or_status(request.send().await?) }
        })
        .instrument(span)
        .await
    }

    /// Like [`send`](Self::send) but also decodes the body; a malformed body is fatal.
    pub async fn send_json<T, F>(&self, label: &str, build: F) -> Result<T, ExecError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("outbound", label);
        execute_with_retries(&self.policy, label, |_| {
            let request = build(&self.client);
            async move {
                let response = success_or_status(request.send().await?)?;
                let url = response.url().to_string();
                let body = response.bytes().await?;
                serde_json::from_slice(&body).map_err(|err| CallError::Decode {
                    url,
                    message: err.to_string(),
                })
            }
        })
        .instrument(span)
        .await
    }
}

fn success_or_status(response: reqwest::Response) -> Result<reqwest::Response, CallError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(CallError::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}
