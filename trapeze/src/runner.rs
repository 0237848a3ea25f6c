//! Control surface: start a run in the background and steer it through a [`RunHandle`].
use crate::aggregator::MetricsSink;
use crate::behavior::Behavior;
use crate::scheduler::{Scheduler, StatusBoard, Timer};
use crate::transport::{ReqwestTransport, Transport};
use arc_swap::ArcSwap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument};
use trapeze_core::{
    ConfigError, MetricsSnapshot, RunConfig, RunStatistics, RunStatus, ScenarioConfig,
};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Control loop failed: {0}")]
    Join(#[from] JoinError),
}

/// Entry point for running a load profile against a [`Behavior`].
///
/// # Example
/// ```no_run
/// use trapeze::prelude::*;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let list = TransactionSpec::new("list_papers")
///         .task(TaskSpec::get("http://127.0.0.1:8080/api/test-papers"));
///     let scenario = Scenario::builder("browse")
///         .action(1, Action::builder("list").transaction(1, list).build()?)
///         .build()?;
///
///     let config = ScenarioConfig::new(
///         "browse",
///         LoadProfile::trapezoidal(50, 5., Duration::from_secs(600)),
///     );
///
///     let stats = Engine::new(config).start(scenario)?.await?;
///     println!("{stats}");
///     Ok(())
/// }
/// ```
pub struct Engine {
    scenario: ScenarioConfig,
    config: RunConfig,
    transport: Option<Arc<dyn Transport>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl Engine {
    pub fn new(scenario: ScenarioConfig) -> Self {
        Self {
            scenario,
            config: RunConfig::default(),
            transport: None,
            sink: None,
        }
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default reqwest-backed transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn sink(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Validate everything and start the run in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self, behavior: impl Behavior) -> Result<RunHandle, ConfigError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.config.pool.max_connections)?),
        };

        let scheduler = Scheduler::new(
            &self.scenario,
            self.config,
            Arc::new(behavior),
            transport,
            self.sink,
        )?;

        let board = scheduler.board();
        let metrics = scheduler.snapshot();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(control_loop(scheduler, self.scenario.name, stop_rx));

        Ok(RunHandle {
            task,
            stop_tx,
            board,
            metrics,
        })
    }
}

#[instrument(name = "scenario", skip_all, fields(name = %name))]
async fn control_loop(
    mut scheduler: Scheduler,
    name: String,
    mut stop_rx: watch::Receiver<bool>,
) -> RunStatistics {
    let mut timer = Timer::new(scheduler.tick_interval()).await;
    scheduler.start();
    debug!("Control loop ticking every {timer}");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                scheduler.tick();
                if scheduler.is_complete() {
                    info!("Load profile complete");
                    break;
                }
            }
            changed = stop_rx.changed() => {
                // A dropped handle stops the run as well.
                if changed.is_err() || *stop_rx.borrow() {
                    info!("Stop requested");
                    break;
                }
            }
        }
    }

    scheduler.stop().await
}

/// Handle to a running load test.
///
/// Awaiting the handle waits for the run to finish on its own; [`RunHandle::stop`] ends it
/// early. Either way the result is the run's final [`RunStatistics`].
#[pin_project::pin_project]
pub struct RunHandle {
    #[pin]
    task: JoinHandle<RunStatistics>,
    stop_tx: watch::Sender<bool>,
    board: Arc<StatusBoard>,
    metrics: Arc<ArcSwap<MetricsSnapshot>>,
}

impl RunHandle {
    /// Live view of the run. Never blocks.
    pub fn status(&self) -> RunStatus {
        self.board.status()
    }

    /// Latest aggregated metrics.
    pub fn metrics(&self) -> Arc<MetricsSnapshot> {
        self.metrics.load_full()
    }

    /// Ask the run to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop the run, drain the virtual users and return the final statistics.
    pub async fn stop(self) -> Result<RunStatistics, RunError> {
        self.request_stop();
        self.await
    }
}

impl Future for RunHandle {
    type Output = Result<RunStatistics, RunError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().task.poll(cx).map_err(RunError::from)
    }
}
