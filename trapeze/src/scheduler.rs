//! Keeps the live virtual-user count on the load shaper's curve.
mod timer;

pub(crate) use timer::Timer;

use crate::aggregator::{Aggregator, MetricsSink, Totals};
use crate::behavior::Behavior;
use crate::context::UserEnv;
use crate::shaper::{shaper_for, LoadShaper};
use crate::transport::{ConnectionPool, Transport};
use crate::user::{UserState, VirtualUser};
use arc_swap::ArcSwap;
use governor::{Quota, RateLimiter};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};
use trapeze_core::{
    AbortedError, ConfigError, LoadProfile, MetricsSnapshot, RunConfig, RunStatistics, RunStatus,
    ScenarioConfig, SpawnFailurePolicy, StopOrder, Topology, TransactionRecord,
    TransactionStatus,
};

/// Lock-free live view of a run, shared with the run handle.
pub(crate) struct StatusBoard {
    started: OnceLock<Instant>,
    finished: OnceLock<Duration>,
    live_users: AtomicUsize,
    totals: Arc<Totals>,
}

impl StatusBoard {
    fn new(totals: Arc<Totals>) -> Self {
        Self {
            started: OnceLock::new(),
            finished: OnceLock::new(),
            live_users: AtomicUsize::new(0),
            totals,
        }
    }

    fn elapsed(&self) -> Duration {
        match self.finished.get() {
            Some(elapsed) => *elapsed,
            None => self
                .started
                .get()
                .map_or(Duration::ZERO, |started| started.elapsed()),
        }
    }

    pub fn status(&self) -> RunStatus {
        let (pass_count, fail_count, aborted_count) = self.totals.load();
        RunStatus {
            elapsed: self.elapsed(),
            live_users: self.live_users.load(Ordering::Relaxed),
            pass_count,
            fail_count,
            aborted_count,
        }
    }
}

/// Owns the pool of virtual users.
///
/// `start` spawns the initial batch, each `tick` converges the live count onto the shaper's
/// target, and `stop` drains everyone and returns the final statistics. Only the scheduler
/// adds or removes users.
pub struct Scheduler {
    name: String,
    profile: LoadProfile,
    topology: Topology,
    shaper: Box<dyn LoadShaper>,
    config: RunConfig,
    behavior: Arc<dyn Behavior>,
    env: UserEnv,
    aggregator: Aggregator,
    board: Arc<StatusBoard>,
    users: VecDeque<VirtualUser>,
    draining: Vec<VirtualUser>,
    started: Option<Instant>,
    next_id: u64,
    peak_users: usize,
    spawned_users: u64,
    spawn_failures: u64,
    retired_slots: u64,
    abandoned_users: u64,
}

impl Scheduler {
    /// Validate the configuration and spawn the metrics aggregator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        scenario: &ScenarioConfig,
        config: RunConfig,
        behavior: Arc<dyn Behavior>,
        transport: Arc<dyn Transport>,
        sink: Option<Arc<dyn MetricsSink>>,
    ) -> Result<Self, ConfigError> {
        let shaper = shaper_for(&scenario.profile)?;
        config.validate()?;

        let limiter = config.max_tps.map(|tps| {
            Arc::new(RateLimiter::direct(
                Quota::per_second(tps).allow_burst(NonZeroU32::MIN),
            ))
        });

        let aggregator = Aggregator::spawn(config.bucket_width, sink);
        let board = Arc::new(StatusBoard::new(aggregator.totals()));

        let env = UserEnv {
            transport,
            pool: ConnectionPool::new(&config.pool),
            recorder: aggregator.recorder(),
            limiter,
            clock: Instant::now(),
            seed: config.seed,
            think_time: config.think_time,
        };

        Ok(Self {
            name: scenario.name.clone(),
            profile: scenario.profile.clone(),
            topology: scenario.topology.clone(),
            shaper,
            config,
            behavior,
            env,
            aggregator,
            board,
            users: VecDeque::new(),
            draining: vec![],
            started: None,
            next_id: 0,
            peak_users: 0,
            spawned_users: 0,
            spawn_failures: 0,
            retired_slots: 0,
            abandoned_users: 0,
        })
    }

    /// Start the run clock and spawn the initial batch of users.
    pub fn start(&mut self) {
        if self.started.is_some() {
            warn!("Scenario {} already started", self.name);
            return;
        }

        let now = Instant::now();
        self.started = Some(now);
        self.env.clock = now;
        let _ = self.board.started.set(now);

        info!(
            "Starting {} ({}), tick={}, total={}",
            self.name,
            self.profile,
            humantime::format_duration(self.config.tick_interval),
            humantime::format_duration(self.shaper.total_duration())
        );
        for machine in &self.topology.machines {
            debug!(
                "Machine {}:{} nodes={} primary={}",
                machine.address, machine.port, machine.nodes, machine.primary
            );
        }

        let target = self.target(Duration::ZERO);
        self.scale_to(target);
        self.publish();
    }

    /// One control-loop step.
    pub fn tick(&mut self) -> RunStatus {
        let elapsed = self.elapsed();
        self.reap();

        let target = self.target(elapsed);
        self.scale_to(target);

        self.aggregator.flush(elapsed);
        self.publish();

        let status = self.board.status();
        trace!("tick: target={target}, draining={}, {status}", self.draining.len());
        status
    }

    /// Whether the profile has played out and no user is left running.
    pub fn is_complete(&self) -> bool {
        self.started.is_some()
            && self.elapsed() >= self.shaper.total_duration()
            && self.users.is_empty()
    }

    /// Signal every user, wait up to the drain timeout, abandon the rest and finalize metrics.
    pub async fn stop(mut self) -> RunStatistics {
        for user in self.users.drain(..) {
            user.signal_stop();
            self.draining.push(user);
        }
        self.board.live_users.store(0, Ordering::Relaxed);

        if !self.draining.is_empty() {
            info!(
                "Stopping {}: draining {} users (timeout {})",
                self.name,
                self.draining.len(),
                humantime::format_duration(self.config.drain_timeout)
            );
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        for mut user in std::mem::take(&mut self.draining) {
            match tokio::time::timeout_at(deadline, user.wait()).await {
                Ok(Ok(())) => self.exited(&user),
                Ok(Err(err)) => {
                    error!("Virtual user {} failed: {err}", user.id());
                    self.claim_aborted(&user);
                }
                Err(_) => {
                    user.abort();
                    let in_flight = self.claim_aborted(&user);
                    self.abandoned_users += 1;
                    warn!(
                        "{}",
                        AbortedError {
                            user: user.id(),
                            transaction: in_flight,
                            waited: self.config.drain_timeout,
                        }
                    );
                }
            }
        }

        let elapsed = self.elapsed();
        let _ = self.board.finished.set(elapsed);
        let (pass_count, fail_count, aborted_count) = self.board.totals.load();
        let report = self.aggregator.finish().await;
        if !report.complete {
            error!(
                "Metrics for {} are incomplete: only totals were kept ({pass_count} pass, {fail_count} fail, {aborted_count} aborted)",
                self.name
            );
        }

        let stats = RunStatistics {
            scenario: self.name,
            elapsed,
            peak_users: self.peak_users,
            spawned_users: self.spawned_users,
            spawn_failures: self.spawn_failures,
            abandoned_users: self.abandoned_users,
            pass_count,
            fail_count,
            aborted_count,
            transactions: report.transactions,
            samples: report.samples,
            metrics_lost: !report.complete,
        };
        info!("{stats}");
        stats
    }

    pub fn status(&self) -> RunStatus {
        self.board.status()
    }

    pub fn metrics(&self) -> Arc<MetricsSnapshot> {
        self.aggregator.snapshot().load_full()
    }

    pub fn live_users(&self) -> usize {
        self.users.len()
    }

    pub(crate) fn board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    pub(crate) fn snapshot(&self) -> Arc<ArcSwap<MetricsSnapshot>> {
        self.aggregator.snapshot()
    }

    pub(crate) fn tick_interval(&self) -> Duration {
        self.config.tick_interval
    }

    fn elapsed(&self) -> Duration {
        self.started
            .map_or(Duration::ZERO, |started| started.elapsed())
    }

    fn target(&self, elapsed: Duration) -> usize {
        let target = self.shaper.target_concurrency(elapsed);
        match self.config.spawn_failure {
            SpawnFailurePolicy::Retire => target.saturating_sub(self.retired_slots as usize),
            SpawnFailurePolicy::Replace => target,
        }
    }

    fn scale_to(&mut self, target: usize) {
        let live = self.users.len();

        if target > live {
            debug!("Spawning {} users ({live} -> {target})", target - live);
            for _ in live..target {
                let id = self.next_id;
                self.next_id += 1;
                self.spawned_users += 1;
                self.users
                    .push_back(VirtualUser::spawn(id, self.behavior.clone(), &self.env));
            }
        } else if target < live {
            debug!("Stopping {} users ({live} -> {target})", live - target);
            for _ in target..live {
                let user = match self.config.stop_order {
                    StopOrder::OldestFirst => self.users.pop_front(),
                    StopOrder::NewestFirst => self.users.pop_back(),
                };
                if let Some(user) = user {
                    user.signal_stop();
                    self.draining.push(user);
                }
            }
        }

        self.peak_users = self.peak_users.max(self.users.len());
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.users)
            .into_iter()
            .partition(VirtualUser::is_finished);
        self.users = running.into();

        let (stopped, draining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.draining)
            .into_iter()
            .partition(VirtualUser::is_finished);
        self.draining = draining;

        for user in finished.iter().chain(stopped.iter()) {
            self.exited(user);
        }
    }

    /// Account for a user whose task has ended.
    fn exited(&mut self, user: &VirtualUser) {
        if let Some(err) = user.spawn_error() {
            warn!("{err}");
            self.spawn_failures += 1;
            if self.config.spawn_failure == SpawnFailurePolicy::Retire {
                self.retired_slots += 1;
            }
        } else if user.state() != UserState::Stopped {
            error!("Virtual user {} panicked", user.id());
            self.claim_aborted(user);
        }
    }

    /// Record the user's in-flight transaction as aborted, if it still has one.
    fn claim_aborted(&self, user: &VirtualUser) -> Option<String> {
        let in_flight = user.take_in_flight()?;
        self.env.recorder.record(TransactionRecord {
            name: in_flight.name.clone(),
            offset: self.elapsed(),
            latency: in_flight.started.elapsed(),
            status: TransactionStatus::Aborted,
        });
        Some(in_flight.name.clone())
    }

    fn publish(&self) {
        self.board
            .live_users
            .store(self.users.len(), Ordering::Relaxed);
    }

    #[cfg(test)]
    fn live_ids(&self) -> Vec<u64> {
        self.users.iter().map(VirtualUser::id).collect()
    }
}
