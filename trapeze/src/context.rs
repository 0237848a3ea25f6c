use crate::aggregator::Recorder;
use crate::transaction::{TransactionOutcome, TransactionSpec};
use crate::transport::{ConnectionPool, Transport};
use arc_swap::ArcSwapOption;
use governor::DefaultDirectRateLimiter;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Per-user state carried across transactions: headers sent with every task and free-form
/// variables for custom behaviors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Session {
    headers: Vec<(String, String)>,
    vars: HashMap<String, String>,
}

impl Session {
    /// Set a header, replacing any existing header of the same name (case-insensitive).
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Transaction currently executing on a virtual user.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub name: String,
    pub started: Instant,
}

/// Everything virtual users of one run share.
#[derive(Clone)]
pub(crate) struct UserEnv {
    pub transport: Arc<dyn Transport>,
    pub pool: ConnectionPool,
    pub recorder: Recorder,
    pub limiter: Option<Arc<DefaultDirectRateLimiter>>,
    pub clock: Instant,
    pub seed: Option<u64>,
    pub think_time: Option<Duration>,
}

impl UserEnv {
    pub fn context(&self, id: u64, in_flight: Arc<ArcSwapOption<InFlight>>) -> UserContext {
        let rng = match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(id)),
            None => SmallRng::from_entropy(),
        };

        UserContext {
            id,
            session: Session::default(),
            rng,
            transport: self.transport.clone(),
            pool: self.pool.clone(),
            recorder: self.recorder.clone(),
            limiter: self.limiter.clone(),
            in_flight,
            clock: self.clock,
            iterations: 0,
        }
    }
}

/// Execution context owned by a single virtual user.
///
/// Passed explicitly to every behavior hook; nothing about the current user lives in globals.
pub struct UserContext {
    id: u64,
    pub session: Session,
    rng: SmallRng,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pool: ConnectionPool,
    pub(crate) recorder: Recorder,
    pub(crate) limiter: Option<Arc<DefaultDirectRateLimiter>>,
    pub(crate) in_flight: Arc<ArcSwapOption<InFlight>>,
    clock: Instant,
    pub(crate) iterations: u64,
}

impl UserContext {
    /// Sequence number of this virtual user within the run.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Completed iterations of the behavior loop.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Time since the start of the run.
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Run a transaction and record its outcome.
    pub async fn execute(&mut self, transaction: &TransactionSpec) -> TransactionOutcome {
        transaction.execute(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_replace_case_insensitively() {
        let mut session = Session::default();
        session.set_header("Authorization", "Bearer a");
        session.set_header("authorization", "Bearer b");
        session.set_header("Accept", "application/json");

        assert_eq!(session.headers().len(), 2);
        assert_eq!(session.header("AUTHORIZATION"), Some("Bearer b"));

        session.remove_header("accept");
        assert_eq!(session.header("Accept"), None);
    }

    #[test]
    fn vars() {
        let mut session = Session::default();
        session.set_var("course", "3");
        assert_eq!(session.var("course"), Some("3"));
        assert_eq!(session.var("missing"), None);
    }
}
