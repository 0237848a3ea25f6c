//! Declarative behavior: weighted actions made of weighted transactions.
mod weighted;

pub use weighted::WeightedSet;

use crate::behavior::Behavior;
use crate::context::UserContext;
use crate::transaction::{TransactionOutcome, TransactionSpec};
use async_trait::async_trait;
use tracing::debug;
use trapeze_core::{ConfigError, HookError};

/// A behavior pattern: transactions picked by weight, plus optional transactions run once per
/// virtual user when it starts and when it stops.
#[derive(Clone, Debug)]
pub struct Action {
    name: String,
    transactions: WeightedSet<TransactionSpec>,
    init: Option<TransactionSpec>,
    end: Option<TransactionSpec>,
}

impl Action {
    pub fn builder(name: impl Into<String>) -> ActionBuilder {
        ActionBuilder {
            name: name.into(),
            transactions: vec![],
            init: None,
            end: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transactions(&self) -> &WeightedSet<TransactionSpec> {
        &self.transactions
    }
}

pub struct ActionBuilder {
    name: String,
    transactions: Vec<(u32, TransactionSpec)>,
    init: Option<TransactionSpec>,
    end: Option<TransactionSpec>,
}

impl ActionBuilder {
    pub fn transaction(mut self, weight: u32, transaction: TransactionSpec) -> Self {
        self.transactions.push((weight, transaction));
        self
    }

    /// Runs once when a virtual user starts.
    pub fn init(mut self, transaction: TransactionSpec) -> Self {
        self.init = Some(transaction);
        self
    }

    /// Runs once when a virtual user stops.
    pub fn end(mut self, transaction: TransactionSpec) -> Self {
        self.end = Some(transaction);
        self
    }

    pub fn build(self) -> Result<Action, ConfigError> {
        self.transactions
            .iter()
            .map(|(_, t)| t)
            .chain(self.init.iter())
            .chain(self.end.iter())
            .try_for_each(TransactionSpec::validate)?;

        let transactions = WeightedSet::new("Action", &self.name, self.transactions, |t| {
            t.name().to_string()
        })?;

        Ok(Action {
            name: self.name,
            transactions,
            init: self.init,
            end: self.end,
        })
    }
}

/// A set of weighted actions plus what every virtual user shares: default headers (opaque
/// credentials go here) and optional setup/teardown transactions.
///
/// ```
/// use trapeze::prelude::*;
///
/// # fn main() -> Result<(), ConfigError> {
/// let list = TransactionSpec::new("list_papers")
///     .task(TaskSpec::get("http://127.0.0.1:8080/api/test-papers").query("page", "0"));
///
/// let scenario = Scenario::builder("default")
///     .bearer_token("secret")
///     .action(1, Action::builder("browse").transaction(1, list).build()?)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Scenario {
    name: String,
    headers: Vec<(String, String)>,
    setup: Option<TransactionSpec>,
    teardown: Option<TransactionSpec>,
    actions: WeightedSet<Action>,
}

impl Scenario {
    pub fn builder(name: impl Into<String>) -> ScenarioBuilder {
        ScenarioBuilder {
            name: name.into(),
            headers: vec![],
            setup: None,
            teardown: None,
            actions: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &WeightedSet<Action> {
        &self.actions
    }
}

pub struct ScenarioBuilder {
    name: String,
    headers: Vec<(String, String)>,
    setup: Option<TransactionSpec>,
    teardown: Option<TransactionSpec>,
    actions: Vec<(u32, Action)>,
}

impl ScenarioBuilder {
    /// Header sent with every task of every virtual user.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer_token(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.header("Authorization", value)
    }

    /// Runs in every virtual user's `on_start`. If it fails the user does not start.
    pub fn setup(mut self, transaction: TransactionSpec) -> Self {
        self.setup = Some(transaction);
        self
    }

    pub fn teardown(mut self, transaction: TransactionSpec) -> Self {
        self.teardown = Some(transaction);
        self
    }

    pub fn action(mut self, weight: u32, action: Action) -> Self {
        self.actions.push((weight, action));
        self
    }

    pub fn build(self) -> Result<Scenario, ConfigError> {
        self.setup
            .iter()
            .chain(self.teardown.iter())
            .try_for_each(TransactionSpec::validate)?;

        let actions = WeightedSet::new("Scenario", &self.name, self.actions, |a| {
            a.name().to_string()
        })?;

        Ok(Scenario {
            name: self.name,
            headers: self.headers,
            setup: self.setup,
            teardown: self.teardown,
            actions,
        })
    }
}

fn required(outcome: TransactionOutcome) -> Result<(), HookError> {
    if outcome.is_pass() {
        return Ok(());
    }

    let cause = outcome
        .tasks
        .iter()
        .find_map(|t| t.error())
        .map(ToString::to_string)
        .unwrap_or_else(|| "failed".to_string());

    Err(HookError::new(format!(
        "Transaction {} failed: {cause}",
        outcome.name
    )))
}

#[async_trait]
impl Behavior for Scenario {
    async fn on_start(&self, ctx: &mut UserContext) -> Result<(), HookError> {
        for (name, value) in &self.headers {
            ctx.session.set_header(name.clone(), value.clone());
        }

        if let Some(setup) = &self.setup {
            required(ctx.execute(setup).await)?;
        }

        for (_, action) in self.actions.iter() {
            if let Some(init) = &action.init {
                required(ctx.execute(init).await)?;
            }
        }

        Ok(())
    }

    async fn run(&self, ctx: &mut UserContext) {
        let action = self.actions.choose(ctx.rng());
        let transaction = action.transactions.choose(ctx.rng());
        let outcome = ctx.execute(transaction).await;
        debug!(
            "User {} ran {}/{}: {:?} in {:?}",
            ctx.id(),
            action.name,
            outcome.name,
            outcome.status,
            outcome.latency
        );
    }

    async fn on_stop(&self, ctx: &mut UserContext) {
        for (_, action) in self.actions.iter() {
            if let Some(end) = &action.end {
                ctx.execute(end).await;
            }
        }

        if let Some(teardown) = &self.teardown {
            ctx.execute(teardown).await;
        }
    }
}
