use std::time::Duration;

/// How often the scheduler re-evaluates the load profile.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long `stop()` waits for virtual users before abandoning them.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Width of a metrics bucket.
pub const DEFAULT_BUCKET_WIDTH: Duration = Duration::from_secs(5);

/// Per-task timeout unless the task sets its own.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of requests in flight across all virtual users.
pub const DEFAULT_POOL_SIZE: usize = 512;

/// How long a task waits for a pooled connection before failing.
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
