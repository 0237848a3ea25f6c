use crate::context::{InFlight, Session, UserContext};
use crate::task::{TaskResult, TaskSpec};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use trapeze_core::{ConfigError, FailurePolicy, TransactionRecord, TransactionStatus};

/// Runs before the first or after the last task of a transaction.
pub type TransactionHook = Arc<dyn Fn(&mut Session) + Send + Sync>;

/// An ordered sequence of tasks recorded as a single pass/fail unit.
#[derive(Clone)]
pub struct TransactionSpec {
    name: String,
    tasks: Vec<TaskSpec>,
    policy: FailurePolicy,
    on_start: Option<TransactionHook>,
    on_stop: Option<TransactionHook>,
}

impl fmt::Debug for TransactionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionSpec")
            .field("name", &self.name)
            .field("tasks", &self.tasks)
            .field("policy", &self.policy)
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

impl TransactionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: vec![],
            policy: FailurePolicy::default(),
            on_start: None,
            on_stop: None,
        }
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Session) + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Session) + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::Empty {
                kind: "Transaction",
                name: self.name.clone(),
            });
        }
        self.tasks.iter().try_for_each(TaskSpec::validate)
    }

    pub(crate) async fn execute(&self, ctx: &mut UserContext) -> TransactionOutcome {
        if let Some(limiter) = &ctx.limiter {
            limiter.until_ready().await;
        }

        let started = Instant::now();
        let started_at = ctx.elapsed();
        ctx.in_flight.store(Some(Arc::new(InFlight {
            name: self.name.clone(),
            started,
        })));

        if let Some(hook) = &self.on_start {
            hook(&mut ctx.session);
        }

        let mut results = Vec::with_capacity(self.tasks.len());
        let mut failed = false;
        for task in &self.tasks {
            let result = task
                .execute(ctx.transport.as_ref(), &ctx.pool, &ctx.session)
                .await;

            let success = result.is_success();
            if let Some(err) = result.error() {
                debug!(
                    "User {}: task {} of {} failed: {err}",
                    ctx.id(),
                    result.name,
                    self.name
                );
            }
            results.push(result);

            if !success {
                failed = true;
                if self.policy == FailurePolicy::AbortRemaining {
                    break;
                }
            }
        }

        if let Some(hook) = &self.on_stop {
            hook(&mut ctx.session);
        }

        let latency = started.elapsed();
        let status = if failed {
            TransactionStatus::Fail
        } else {
            TransactionStatus::Pass
        };

        // A user abandoned during drain has its transaction claimed by the scheduler instead.
        if ctx.in_flight.swap(None).is_some() {
            ctx.recorder.record(TransactionRecord {
                name: self.name.clone(),
                offset: ctx.elapsed(),
                latency,
                status,
            });
        }

        let outcome = TransactionOutcome {
            name: self.name.clone(),
            started_at,
            latency,
            status,
            tasks: results,
        };
        trace!("{outcome:?}");
        outcome
    }
}

/// Result of one transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionOutcome {
    pub name: String,
    /// Offset from the start of the run.
    pub started_at: Duration,
    pub latency: Duration,
    pub status: TransactionStatus,
    /// Results of the tasks that ran, in order.
    pub tasks: Vec<TaskResult>,
}

impl TransactionOutcome {
    pub fn is_pass(&self) -> bool {
        self.status == TransactionStatus::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, MockTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trapeze_core::TaskError;

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_remaining_tasks() {
        let transport = MockTransport::new().delay("http://mock/hang", Duration::from_secs(60));
        let (env, aggregator, transport) = harness(transport);
        let mut ctx = env.context(0, Default::default());

        let txn = TransactionSpec::new("generate_paper")
            .task(TaskSpec::post("http://mock/hang").timeout(Duration::from_secs(1)))
            .task(TaskSpec::get("http://mock/list"));

        let outcome = ctx.execute(&txn).await;

        assert_eq!(outcome.status, TransactionStatus::Fail);
        assert_eq!(outcome.tasks.len(), 1);
        assert_eq!(
            outcome.tasks[0].error(),
            Some(&TaskError::Timeout(Duration::from_secs(1)))
        );
        assert_eq!(transport.calls("http://mock/list"), 0);
        assert!(logs_contain("failed: Timed out after 1s"));

        let report = aggregator.finish().await;
        assert_eq!(report.transactions[0].fail, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn continue_remaining_runs_every_task() {
        let transport = MockTransport::new().status("http://mock/broken", 500);
        let (env, aggregator, transport) = harness(transport);
        let mut ctx = env.context(0, Default::default());

        let txn = TransactionSpec::new("mixed")
            .policy(FailurePolicy::ContinueRemaining)
            .task(TaskSpec::get("http://mock/broken"))
            .task(TaskSpec::get("http://mock/list"));

        let outcome = ctx.execute(&txn).await;

        assert!(!outcome.is_pass());
        assert_eq!(outcome.tasks.len(), 2);
        assert!(outcome.tasks[1].is_success());
        assert_eq!(transport.calls("http://mock/list"), 1);

        let report = aggregator.finish().await;
        assert_eq!((report.transactions[0].pass, report.transactions[0].fail), (0, 1));
    }

    #[tokio::test]
    async fn hooks_wrap_tasks_and_record_once() {
        let (env, aggregator, _) = harness(MockTransport::new());
        let mut ctx = env.context(3, Default::default());
        let stops = Arc::new(AtomicUsize::new(0));

        let txn = {
            let stops = stops.clone();
            TransactionSpec::new("list")
                .on_start(|session| session.set_var("phase", "started"))
                .on_stop(move |_| {
                    stops.fetch_add(1, Ordering::SeqCst);
                })
                .task(TaskSpec::get("http://mock/list"))
        };

        let outcome = ctx.execute(&txn).await;
        assert!(outcome.is_pass());
        assert_eq!(ctx.session.var("phase"), Some("started"));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(ctx.in_flight.load().is_none());

        let report = aggregator.finish().await;
        assert_eq!(report.transactions.len(), 1);
        assert_eq!(report.transactions[0].total(), 1);
    }

    #[test]
    fn empty_transaction_is_rejected() {
        assert_eq!(
            TransactionSpec::new("nothing").validate(),
            Err(ConfigError::Empty {
                kind: "Transaction",
                name: "nothing".to_string()
            })
        );
    }
}
