use std::time::Duration;
use thiserror::Error;

/// Invalid configuration. Always rejected before a run starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Ramp rate must be a positive, finite number of users per second (got {0})")]
    InvalidRampRate(f64),

    #[error("Ramp-down rate must be a positive, finite number of users per second (got {0})")]
    InvalidRampDownRate(f64),

    #[error("Ramping {users} users at {rate} users per second takes longer than any run can last")]
    RampTooLong { users: u32, rate: f64 },

    #[error("Run duration must be greater than zero")]
    ZeroDuration,

    #[error("Step mode requires a step of at least one user")]
    ZeroStep,

    #[error("Tick interval must be greater than zero")]
    ZeroTickInterval,

    #[error("Metrics bucket width must be greater than zero")]
    ZeroBucketWidth,

    #[error("Connection pool must allow at least one connection")]
    ZeroPoolSize,

    #[error("{kind} \"{name}\" has a weight of zero")]
    ZeroWeight { kind: &'static str, name: String },

    #[error("Weights of {kind} \"{name}\" add up to more than {}", u32::MAX)]
    WeightOverflow { kind: &'static str, name: String },

    #[error("{kind} \"{name}\" has nothing to run")]
    Empty { kind: &'static str, name: String },

    #[error("Task \"{0}\" has an empty URL")]
    EmptyUrl(String),

    #[error("Retry policy for task \"{0}\" must allow at least one attempt")]
    ZeroAttempts(String),

    #[error("Could not build the HTTP client: {0}")]
    HttpClient(String),
}

/// A virtual user's `on_start` hook failed. The run continues without it.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Virtual user {user} failed to start: {source}")]
pub struct SpawnError {
    pub user: u64,
    #[source]
    pub source: HookError,
}

/// Error returned by a behavior hook.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<TaskError> for HookError {
    fn from(err: TaskError) -> Self {
        Self::new(err.to_string())
    }
}

/// Failure of a single task. Captured as data in the task's result, never propagated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaskError {
    #[error("Timed out after {}", human(.0))]
    Timeout(Duration),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("No pooled connection available after {}", human(.0))]
    PoolExhausted(Duration),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// A virtual user did not stop within the drain timeout and was abandoned.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Virtual user {user} abandoned after {} (in flight: {})", human(.waited), in_flight(.transaction))]
pub struct AbortedError {
    pub user: u64,
    pub transaction: Option<String>,
    pub waited: Duration,
}

fn human(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

fn in_flight(transaction: &Option<String>) -> &str {
    transaction.as_deref().unwrap_or("nothing")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_messages() {
        assert_eq!(
            TaskError::Timeout(Duration::from_millis(1500)).to_string(),
            "Timed out after 1s 500ms"
        );
        assert_eq!(TaskError::Status(503).to_string(), "Unexpected status 503");
    }

    #[test]
    fn aborted_error_names_transaction() {
        let err = AbortedError {
            user: 7,
            transaction: Some("generate_paper".to_string()),
            waited: Duration::from_secs(2),
        };
        assert_eq!(
            err.to_string(),
            "Virtual user 7 abandoned after 2s (in flight: generate_paper)"
        );
    }

    #[test]
    fn hook_error_from_task_error() {
        let err: HookError = TaskError::Connect("refused".to_string()).into();
        assert_eq!(err.message, "Connection error: refused");
    }
}
