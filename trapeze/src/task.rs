//! A single request unit of a transaction.
use crate::context::Session;
use crate::transport::{Body, ConnectionPool, Method, Request, Response, Transport, TransportError};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use trapeze_core::{ConfigError, TaskError, DEFAULT_TASK_TIMEOUT};

const DEFAULT_ACCEPTED: RangeInclusive<u16> = 200..=399;

/// Opt-in retry for a task. Without one a task is attempted exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff starting at `initial_delay`, doubling per attempt.
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Declaration of one HTTP request.
///
/// Built with chained setters:
///
/// ```
/// use trapeze::prelude::*;
/// use std::time::Duration;
///
/// let task = TaskSpec::get("http://127.0.0.1:8080/api/test-papers")
///     .query("page", "0")
///     .query("size", "12")
///     .timeout(Duration::from_secs(5));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSpec {
    name: String,
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Body,
    timeout: Duration,
    accepted: Vec<RangeInclusive<u16>>,
    retry: Option<RetryPolicy>,
}

impl TaskSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: format!("{method} {url}"),
            method,
            url,
            query: vec![],
            headers: vec![],
            body: Body::Empty,
            timeout: DEFAULT_TASK_TIMEOUT,
            accepted: vec![],
            retry: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Task-level header. Overrides a session header of the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Body::Json(body);
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Text(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Accept statuses in `range`. Replaces the default `200..=399` once called.
    pub fn accept_status(mut self, range: RangeInclusive<u16>) -> Self {
        self.accepted.push(range);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn task_name(&self) -> &str {
        &self.name
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl(self.name.clone()));
        }
        if let Some(RetryPolicy {
            max_attempts: 0, ..
        }) = self.retry
        {
            return Err(ConfigError::ZeroAttempts(self.name.clone()));
        }
        Ok(())
    }

    fn accepts(&self, status: u16) -> bool {
        if self.accepted.is_empty() {
            DEFAULT_ACCEPTED.contains(&status)
        } else {
            self.accepted.iter().any(|r| r.contains(&status))
        }
    }

    fn request(&self, session: &Session) -> Request {
        let mut headers: Vec<(String, String)> = session
            .headers()
            .iter()
            .filter(|(name, _)| {
                !self
                    .headers
                    .iter()
                    .any(|(own, _)| own.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect();
        headers.extend(self.headers.iter().cloned());

        Request {
            method: self.method,
            url: self.url.clone(),
            query: self.query.clone(),
            headers,
            body: self.body.clone(),
        }
    }

    /// Run the task. Failures are returned inside the result, never as an `Err`.
    pub(crate) async fn execute(
        &self,
        transport: &dyn Transport,
        pool: &ConnectionPool,
        session: &Session,
    ) -> TaskResult {
        let request = self.request(session);
        let max_attempts = self.retry.map_or(1, |r| r.max_attempts.max(1));
        let start = Instant::now();

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let outcome = self.attempt(transport, pool, &request).await;

            match (&outcome, self.retry) {
                (Err(err), Some(policy)) if attempts < max_attempts => {
                    let delay = policy.delay_for_attempt(attempts);
                    debug!(
                        "Task {} failed ({err}), retrying in {}",
                        self.name,
                        humantime::format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => break outcome,
            }
        };

        let result = TaskResult {
            name: self.name.clone(),
            latency: start.elapsed(),
            attempts,
            outcome,
        };
        trace!("{result:?}");
        result
    }

    async fn attempt(
        &self,
        transport: &dyn Transport,
        pool: &ConnectionPool,
        request: &Request,
    ) -> Result<Response, TaskError> {
        let _permit = pool.acquire().await?;

        let response = match tokio::time::timeout(self.timeout, transport.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(TransportError::Timeout)) | Err(_) => {
                return Err(TaskError::Timeout(self.timeout))
            }
            Ok(Err(TransportError::Connect(msg))) => return Err(TaskError::Connect(msg)),
            Ok(Err(TransportError::Request(msg))) => return Err(TaskError::Transport(msg)),
        };

        if self.accepts(response.status) {
            Ok(response)
        } else {
            Err(TaskError::Status(response.status))
        }
    }
}

/// Result of one task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskResult {
    pub name: String,
    /// Wall time including retries and pool waits.
    pub latency: Duration,
    pub attempts: u32,
    pub outcome: Result<Response, TaskError>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Status of the last response, if one arrived.
    pub fn status(&self) -> Option<u16> {
        match &self.outcome {
            Ok(response) => Some(response.status),
            Err(TaskError::Status(status)) => Some(*status),
            Err(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }
}
