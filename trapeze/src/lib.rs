#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod aggregator;
pub mod behavior;
pub mod context;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod shaper;
pub mod task;
pub mod transaction;
pub mod transport;

pub(crate) mod user;

#[cfg(test)]
pub(crate) mod testing;

pub use behavior::Behavior;
pub use runner::{Engine, RunError, RunHandle};
pub use scenario::{Action, Scenario};
pub use user::UserState;

pub mod prelude {
    pub use crate::aggregator::{MemorySink, MetricsSink, TracingSink};
    pub use crate::behavior::Behavior;
    pub use crate::context::{Session, UserContext};
    pub use crate::runner::{Engine, RunError, RunHandle};
    pub use crate::scenario::{Action, Scenario};
    pub use crate::task::{RetryPolicy, TaskResult, TaskSpec};
    pub use crate::transaction::{TransactionOutcome, TransactionSpec};
    pub use crate::transport::{Method, ReqwestTransport, Transport};

    pub use trapeze_core::{
        ConfigError, FailurePolicy, HookError, LoadProfile, Machine, RunConfig, RunStatistics,
        RunStatus, ScenarioConfig, SpawnFailurePolicy, StopOrder, Topology, TransactionStatus,
    };
}
