use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::instrument;

use runnerhub_types::{Classify, ErrorCode, JobPriority, Repository, UpstreamSnapshot};
use utils::context::AppContext;
use utils::telemetry::UpstreamMetrics;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("rate limited, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },

    #[error("unauthorized against the upstream API")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream server error: {status}")]
    Upstream5xx { status: u16 },

    #[error("transport: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("client is shutting down")]
    Closed,
}

impl Classify for UpstreamError {
    fn code(&self) -> ErrorCode {
        match self {
            UpstreamError::RateLimited { .. } => ErrorCode::RateLimited,
            UpstreamError::Unauthorized => ErrorCode::Unauthorized,
            UpstreamError::NotFound(_) => ErrorCode::NotFound,
            UpstreamError::Upstream5xx { .. } => ErrorCode::Transient,
            UpstreamError::Transport(_) => ErrorCode::Transient,
            UpstreamError::Protocol(_) => ErrorCode::Unrecoverable,
            UpstreamError::Closed => ErrorCode::Unavailable,
        }
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpstreamRunner {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<UpstreamRunnerLabel>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpstreamRunnerLabel {
    pub name: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub name: Option<String>,
    pub status: Option<String>,
    pub head_branch: Option<String>,
}

/// The upstream surface the orchestrator depends on. Tests substitute a
/// fake; production uses [`UpstreamClient`].
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn issue_runner_registration_token(
        &self,
        repository: &Repository,
    ) -> UpstreamResult<RegistrationToken>;

    /// Idempotent: removing an already-gone runner succeeds.
    async fn remove_runner(&self, repository: &Repository, runner_id: i64) -> UpstreamResult<()>;

    async fn list_runners(&self, repository: &Repository) -> UpstreamResult<Vec<UpstreamRunner>>;

    async fn list_workflow_runs(
        &self,
        repository: &Repository,
        status: Option<&str>,
    ) -> UpstreamResult<Vec<WorkflowRun>>;

    fn rate_limit(&self) -> UpstreamSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleStrategy {
    Conservative,
    #[default]
    Adaptive,
    Aggressive,
}

/// Locally observed quota, mirrored from response headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitState {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<DateTime<Utc>>,
}

impl RateLimitState {
    pub fn update_from_headers(&mut self, headers: &HeaderMap) {
        let parse = |name: &str| -> Option<u64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        };
        if let Some(limit) = parse("x-ratelimit-limit") {
            self.limit = Some(limit);
        }
        if let Some(remaining) = parse("x-ratelimit-remaining") {
            self.remaining = Some(remaining);
        }
        if let Some(reset) = parse("x-ratelimit-reset") {
            self.reset = Utc.timestamp_opt(reset as i64, 0).single();
        }
    }

    /// Minimum delay before the next request may be issued. Regardless of
    /// strategy, a spent quota always waits for the reset.
    pub fn required_delay(&self, strategy: ThrottleStrategy, now: DateTime<Utc>) -> Duration {
        let time_to_reset = self
            .reset
            .map(|reset| (reset - now).to_std().unwrap_or_default())
            .unwrap_or_default();

        if self.remaining == Some(0) && !time_to_reset.is_zero() {
            return time_to_reset;
        }

        let (Some(limit), Some(remaining)) = (self.limit, self.remaining) else {
            return Duration::ZERO;
        };
        if limit == 0 {
            return Duration::ZERO;
        }

        match strategy {
            ThrottleStrategy::Conservative => {
                let fraction = remaining as f64 / limit as f64;
                if fraction < 0.05 {
                    Duration::from_secs(5)
                } else if fraction < 0.10 {
                    Duration::from_secs(2)
                } else if fraction < 0.20 {
                    Duration::from_millis(500)
                } else {
                    Duration::ZERO
                }
            }
            ThrottleStrategy::Aggressive => {
                if remaining < 50 {
                    Duration::from_millis(500)
                } else {
                    Duration::ZERO
                }
            }
            ThrottleStrategy::Adaptive => {
                if remaining == 0 || time_to_reset.is_zero() {
                    return Duration::ZERO;
                }
                // spread the remaining budget linearly until reset
                let per_request = time_to_reset.as_secs_f64() / remaining as f64;
                let epsilon = 0.05;
                Duration::from_secs_f64((per_request - epsilon).max(0.0))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub token: String,
    pub strategy: ThrottleStrategy,
    /// Soft requests-per-hour cap below the real limit
    pub max_rph: Option<u32>,
    pub max_retries: u32,
    pub request_timeout_s: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: String::new(),
            strategy: ThrottleStrategy::Adaptive,
            max_rph: None,
            max_retries: 3,
            request_timeout_s: 30,
        }
    }
}

struct QueuedRequest {
    priority: JobPriority,
    seq: u64,
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    respond: oneshot::Sender<UpstreamResult<serde_json::Value>>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedRequest {}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: lowest band number (highest priority) first, then FIFO
        match other.priority.band().cmp(&self.priority.band()) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Prioritized, rate-limit-aware client for the upstream REST API. Calls are
/// queued by priority; a single pump task drains the queue, applying the
/// throttle strategy and retrying transient failures with jittered backoff.
pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
    state: Arc<RwLock<RateLimitState>>,
    queue: Arc<Mutex<BinaryHeap<QueuedRequest>>>,
    notify: Arc<Notify>,
    seq: AtomicU64,
    metrics: UpstreamMetrics,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig, metrics: UpstreamMetrics) -> UpstreamResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent("runnerhub")
            .timeout(Duration::from_secs(config.request_timeout_s))
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            config,
            state: Arc::new(RwLock::new(RateLimitState::default())),
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            notify: Arc::new(Notify::new()),
            seq: AtomicU64::new(0),
            metrics,
        })
    }

    /// Spawn the pump. Requests enqueued before this resolve once it runs.
    pub fn start(self: &Arc<Self>, ctx: AppContext) {
        let client = self.clone();
        let mut kill = ctx.get_kill_receiver();
        ctx.rt.spawn(async move {
            loop {
                let next = client.queue.lock().unwrap().pop();
                match next {
                    Some(request) => client.pump_one(request).await,
                    None => {
                        tokio::select! {
                            _ = client.notify.notified() => {}
                            _ = kill.recv() => {
                                tracing::debug!("Upstream pump shutting down");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn request(
        &self,
        priority: JobPriority,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
    ) -> UpstreamResult<serde_json::Value> {
        let (respond, rx) = oneshot::channel();
        self.queue.lock().unwrap().push(QueuedRequest {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            method,
            path,
            body,
            respond,
        });
        self.notify.notify_one();
        rx.await.map_err(|_| UpstreamError::Closed)?
    }

    #[instrument(level = "debug", skip(self, request), fields(subsys = "Upstream", path = %request.path))]
    async fn pump_one(&self, request: QueuedRequest) {
        let delay = {
            let state = *self.state.read().unwrap();
            let mut delay = state.required_delay(self.config.strategy, Utc::now());
            if let Some(max_rph) = self.config.max_rph {
                let spacing = Duration::from_secs_f64(3600.0 / max_rph.max(1) as f64);
                delay = delay.max(spacing);
            }
            delay
        };
        if !delay.is_zero() {
            self.metrics.throttle_delays.add(1, &[]);
            tokio::time::sleep(delay).await;
        }

        let result = self.execute(&request).await;
        let _ = request.respond.send(result);
    }

    async fn execute(&self, request: &QueuedRequest) -> UpstreamResult<serde_json::Value> {
        let url = format!("{}{}", self.config.base_url, request.path);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.metrics.requests.add(1, &[]);

            let mut builder = self
                .http
                .request(request.method.clone(), &url)
                .header("accept", "application/vnd.github+json")
                .bearer_auth(&self.config.token);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let outcome = match builder.send().await {
                Ok(response) => {
                    {
                        let mut state = self.state.write().unwrap();
                        state.update_from_headers(response.headers());
                        if let Some(remaining) = state.remaining {
                            self.metrics.rate_limit_remaining.record(remaining, &[]);
                        }
                    }
                    self.classify_response(response).await
                }
                Err(err) => Err(UpstreamError::Transport(err.to_string())),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) && attempt <= self.config.max_retries => {
                    // an explicit retry-after wins over the generic backoff
                    let backoff = match &err {
                        UpstreamError::RateLimited { retry_after_s } => {
                            Duration::from_secs(*retry_after_s)
                        }
                        _ => backoff_with_jitter(attempt),
                    };
                    tracing::debug!(
                        "Upstream retry {}/{} after {:?}: {}",
                        attempt,
                        self.config.max_retries,
                        backoff,
                        err
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn classify_response(
        &self,
        response: reqwest::Response,
    ) -> UpstreamResult<serde_json::Value> {
        let status = response.status();
        match status {
            s if s.is_success() => {
                if s == StatusCode::NO_CONTENT {
                    return Ok(serde_json::Value::Null);
                }
                response
                    .json()
                    .await
                    .map_err(|e| UpstreamError::Protocol(e.to_string()))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UpstreamError::Unauthorized),
            StatusCode::NOT_FOUND => Err(UpstreamError::NotFound(status.to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_s = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                Err(UpstreamError::RateLimited { retry_after_s })
            }
            s if s.is_server_error() => Err(UpstreamError::Upstream5xx { status: s.as_u16() }),
            s => Err(UpstreamError::Protocol(format!("unexpected status {s}"))),
        }
    }
}

fn retryable(err: &UpstreamError) -> bool {
    matches!(
        err,
        UpstreamError::Upstream5xx { .. }
            | UpstreamError::Transport(_)
            | UpstreamError::RateLimited { .. }
    )
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 250u64.saturating_mul(1 << attempt.min(8));
    let jitter_ms = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter_ms)
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn issue_runner_registration_token(
        &self,
        repository: &Repository,
    ) -> UpstreamResult<RegistrationToken> {
        let value = self
            .request(
                JobPriority::High,
                Method::POST,
                format!("/repos/{}/actions/runners/registration-token", repository),
                None,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| UpstreamError::Protocol(e.to_string()))
    }

    async fn remove_runner(&self, repository: &Repository, runner_id: i64) -> UpstreamResult<()> {
        match self
            .request(
                JobPriority::Normal,
                Method::DELETE,
                format!("/repos/{}/actions/runners/{}", repository, runner_id),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            // already gone; removal is idempotent
            Err(UpstreamError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn list_runners(&self, repository: &Repository) -> UpstreamResult<Vec<UpstreamRunner>> {
        let value = self
            .request(
                JobPriority::Normal,
                Method::GET,
                format!("/repos/{}/actions/runners?per_page=100", repository),
                None,
            )
            .await?;
        serde_json::from_value(
            value
                .get("runners")
                .cloned()
                .unwrap_or(serde_json::Value::Array(Vec::new())),
        )
        .map_err(|e| UpstreamError::Protocol(e.to_string()))
    }

    async fn list_workflow_runs(
        &self,
        repository: &Repository,
        status: Option<&str>,
    ) -> UpstreamResult<Vec<WorkflowRun>> {
        let mut path = format!("/repos/{}/actions/runs?per_page=100", repository);
        if let Some(status) = status {
            path.push_str(&format!("&status={status}"));
        }
        let value = self
            .request(JobPriority::Low, Method::GET, path, None)
            .await?;
        serde_json::from_value(
            value
                .get("workflow_runs")
                .cloned()
                .unwrap_or(serde_json::Value::Array(Vec::new())),
        )
        .map_err(|e| UpstreamError::Protocol(e.to_string()))
    }

    fn rate_limit(&self) -> UpstreamSnapshot {
        let state = self.state.read().unwrap();
        UpstreamSnapshot {
            remaining: state.remaining,
            reset: state.reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(limit: u64, remaining: u64, reset_in_s: i64) -> RateLimitState {
        RateLimitState {
            limit: Some(limit),
            remaining: Some(remaining),
            reset: Some(Utc::now() + chrono::Duration::seconds(reset_in_s)),
        }
    }

    #[test]
    fn spent_quota_always_waits_for_reset() {
        let now = Utc::now();
        let s = state(5000, 0, 120);
        for strategy in [
            ThrottleStrategy::Conservative,
            ThrottleStrategy::Adaptive,
            ThrottleStrategy::Aggressive,
        ] {
            let delay = s.required_delay(strategy, now);
            assert!(
                delay >= Duration::from_secs(110),
                "{strategy:?} must wait for reset, got {delay:?}"
            );
        }
    }

    #[test]
    fn conservative_ladder() {
        let now = Utc::now();
        assert_eq!(
            state(1000, 40, 600).required_delay(ThrottleStrategy::Conservative, now),
            Duration::from_secs(5)
        );
        assert_eq!(
            state(1000, 90, 600).required_delay(ThrottleStrategy::Conservative, now),
            Duration::from_secs(2)
        );
        assert_eq!(
            state(1000, 150, 600).required_delay(ThrottleStrategy::Conservative, now),
            Duration::from_millis(500)
        );
        assert_eq!(
            state(1000, 900, 600).required_delay(ThrottleStrategy::Conservative, now),
            Duration::ZERO
        );
    }

    #[test]
    fn aggressive_only_throttles_at_the_edge() {
        let now = Utc::now();
        assert_eq!(
            state(5000, 5000, 600).required_delay(ThrottleStrategy::Aggressive, now),
            Duration::ZERO
        );
        assert!(
            state(5000, 49, 600).required_delay(ThrottleStrategy::Aggressive, now)
                > Duration::ZERO
        );
    }

    #[test]
    fn adaptive_spreads_budget_linearly() {
        let now = Utc::now();
        // 100 requests over ~200s -> about 2s per request minus epsilon
        let delay = state(5000, 100, 200).required_delay(ThrottleStrategy::Adaptive, now);
        assert!(delay > Duration::from_millis(1500) && delay < Duration::from_millis(2500));

        // plenty of budget -> effectively no delay
        let delay = state(5000, 5000, 60).required_delay(ThrottleStrategy::Adaptive, now);
        assert!(delay < Duration::from_millis(50));
    }

    #[test]
    fn header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", "5000".parse().unwrap());
        headers.insert("x-ratelimit-remaining", "4999".parse().unwrap());
        headers.insert("x-ratelimit-reset", "1893456000".parse().unwrap());

        let mut state = RateLimitState::default();
        state.update_from_headers(&headers);
        assert_eq!(state.limit, Some(5000));
        assert_eq!(state.remaining, Some(4999));
        assert!(state.reset.is_some());
    }

    #[test]
    fn queue_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        let mk = |priority, seq| {
            let (respond, _rx) = oneshot::channel();
            QueuedRequest {
                priority,
                seq,
                method: Method::GET,
                path: "/".to_string(),
                body: None,
                respond,
            }
        };
        heap.push(mk(JobPriority::Low, 0));
        heap.push(mk(JobPriority::Critical, 1));
        heap.push(mk(JobPriority::Critical, 2));
        heap.push(mk(JobPriority::Normal, 3));

        let order: Vec<(JobPriority, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|r| (r.priority, r.seq))
            .collect();
        assert_eq!(
            order,
            vec![
                (JobPriority::Critical, 1),
                (JobPriority::Critical, 2),
                (JobPriority::Normal, 3),
                (JobPriority::Low, 0),
            ]
        );
    }
}
