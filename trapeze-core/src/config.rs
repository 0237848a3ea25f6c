use crate::{
    ConfigError, DEFAULT_BUCKET_WIDTH, DEFAULT_DRAIN_TIMEOUT, DEFAULT_POOL_ACQUIRE_TIMEOUT,
    DEFAULT_POOL_SIZE, DEFAULT_TICK_INTERVAL,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

/// Shape of the load curve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProfileMode {
    /// Linear ramp-up, plateau, linear ramp-down.
    Trapezoidal,
    /// Same curve as `Trapezoidal`, but users are added and removed in batches of `step`.
    Step { step: u32 },
    /// All users for the whole duration.
    Constant,
}

/// Load profile of a scenario.
///
/// `duration` is measured from the start of the run until ramp-down begins. The ramp-down
/// window follows it, so a run lasts `duration + users / ramp_down_rate`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadProfile {
    #[serde(flatten)]
    pub mode: ProfileMode,
    pub users: u32,
    /// Users per second.
    pub ramp_rate: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration: Duration,
    /// Users per second removed during ramp-down. Defaults to `ramp_rate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_down_rate: Option<f64>,
}

impl LoadProfile {
    pub fn trapezoidal(users: u32, ramp_rate: f64, duration: Duration) -> Self {
        Self {
            mode: ProfileMode::Trapezoidal,
            users,
            ramp_rate,
            duration,
            ramp_down_rate: None,
        }
    }

    pub fn step(users: u32, ramp_rate: f64, step: u32, duration: Duration) -> Self {
        Self {
            mode: ProfileMode::Step { step },
            ..Self::trapezoidal(users, ramp_rate, duration)
        }
    }

    pub fn constant(users: u32, duration: Duration) -> Self {
        Self {
            mode: ProfileMode::Constant,
            ..Self::trapezoidal(users, f64::from(users.max(1)), duration)
        }
    }

    pub fn with_ramp_down_rate(mut self, rate: f64) -> Self {
        self.ramp_down_rate = Some(rate);
        self
    }

    pub fn ramp_down_rate(&self) -> f64 {
        self.ramp_down_rate.unwrap_or(self.ramp_rate)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ramp_rate.is_finite() && self.ramp_rate > 0.) {
            return Err(ConfigError::InvalidRampRate(self.ramp_rate));
        }

        if let Some(rate) = self.ramp_down_rate {
            if !(rate.is_finite() && rate > 0.) {
                return Err(ConfigError::InvalidRampDownRate(rate));
            }
        }

        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }

        if let ProfileMode::Step { step: 0 } = self.mode {
            return Err(ConfigError::ZeroStep);
        }

        Ok(())
    }
}

impl fmt::Display for LoadProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            ProfileMode::Trapezoidal => "trapezoidal".to_string(),
            ProfileMode::Step { step } => format!("step({step})"),
            ProfileMode::Constant => "constant".to_string(),
        };
        write!(
            f,
            "{mode} users={} ramp={}/s duration={}",
            self.users,
            self.ramp_rate,
            humantime::format_duration(self.duration)
        )
    }
}

/// A load machine. Carried as opaque configuration; the engine runs in a single process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    #[serde(default)]
    pub primary: bool,
}

fn default_nodes() -> u32 {
    1
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub machines: Vec<Machine>,
}

impl Topology {
    pub fn primary(&self) -> Option<&Machine> {
        self.machines.iter().find(|m| m.primary)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter().filter(|m| !m.primary)
    }
}

/// Named load profile plus machine topology.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub profile: LoadProfile,
    #[serde(default)]
    pub topology: Topology,
}

impl ScenarioConfig {
    pub fn new(name: &str, profile: LoadProfile) -> Self {
        Self {
            name: name.to_string(),
            profile,
            topology: Topology::default(),
        }
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }
}

/// Which virtual users are stopped first when the target drops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// What happens to a slot whose virtual user failed `on_start`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnFailurePolicy {
    /// The slot is lost for the rest of the run.
    #[default]
    Retire,
    /// The next tick spawns a replacement.
    Replace,
}

/// What a transaction does after one of its tasks fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    AbortRemaining,
    ContinueRemaining,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_POOL_SIZE,
            acquire_timeout: DEFAULT_POOL_ACQUIRE_TIMEOUT,
        }
    }
}

/// Engine knobs that are not part of the load profile.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub drain_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub bucket_width: Duration,
    pub stop_order: StopOrder,
    pub spawn_failure: SpawnFailurePolicy,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub think_time: Option<Duration>,
    pub max_tps: Option<NonZeroU32>,
    pub seed: Option<u64>,
    pub pool: PoolConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            bucket_width: DEFAULT_BUCKET_WIDTH,
            stop_order: StopOrder::default(),
            spawn_failure: SpawnFailurePolicy::default(),
            think_time: None,
            max_tps: None,
            seed: None,
            pool: PoolConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn bucket_width(mut self, width: Duration) -> Self {
        self.bucket_width = width;
        self
    }

    pub fn stop_order(mut self, order: StopOrder) -> Self {
        self.stop_order = order;
        self
    }

    pub fn spawn_failure(mut self, policy: SpawnFailurePolicy) -> Self {
        self.spawn_failure = policy;
        self
    }

    pub fn think_time(mut self, pause: Duration) -> Self {
        self.think_time = Some(pause);
        self
    }

    pub fn max_tps(mut self, tps: NonZeroU32) -> Self {
        self.max_tps = Some(tps);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn pool(mut self, max_connections: usize, acquire_timeout: Duration) -> Self {
        self.pool = PoolConfig {
            max_connections,
            acquire_timeout,
        };
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.bucket_width.is_zero() {
            return Err(ConfigError::ZeroBucketWidth);
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        Ok(())
    }
}
