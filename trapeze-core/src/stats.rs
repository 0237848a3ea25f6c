use crate::{LatencySummary, MetricsSample};
use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds};
use std::fmt;
use std::time::Duration;

/// Live view of a run, cheap to read at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatus {
    pub elapsed: Duration,
    pub live_users: usize,
    pub pass_count: u64,
    pub fail_count: u64,
    pub aborted_count: u64,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "elapsed={}, users={}, pass={}, fail={}, aborted={}",
            humantime::format_duration(self.elapsed),
            self.live_users,
            self.pass_count,
            self.fail_count,
            self.aborted_count
        )
    }
}

/// Totals for one transaction name over the whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionSummary {
    pub name: String,
    pub pass: u64,
    pub fail: u64,
    pub aborted: u64,
    pub latency: LatencySummary,
}

impl TransactionSummary {
    pub fn total(&self) -> u64 {
        self.pass + self.fail + self.aborted
    }
}

/// Final statistics of a run.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    pub scenario: String,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub elapsed: Duration,
    pub peak_users: usize,
    pub spawned_users: u64,
    pub spawn_failures: u64,
    pub abandoned_users: u64,
    pub pass_count: u64,
    pub fail_count: u64,
    pub aborted_count: u64,
    pub transactions: Vec<TransactionSummary>,
    pub samples: Vec<MetricsSample>,
    /// The metrics aggregator failed; `transactions` and `samples` are missing. The
    /// pass/fail/aborted totals are still exact.
    pub metrics_lost: bool,
}

impl RunStatistics {
    pub fn total(&self) -> u64 {
        self.pass_count + self.fail_count + self.aborted_count
    }

    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.,
            total => (self.fail_count + self.aborted_count) as f64 / total as f64,
        }
    }

    pub fn transaction(&self, name: &str) -> Option<&TransactionSummary> {
        self.transactions.iter().find(|t| t.name == name)
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} in {}, peak users={}, spawned={}, spawn failures={}, abandoned={}",
            self.scenario,
            self.total(),
            humantime::format_duration(self.elapsed),
            self.peak_users,
            self.spawned_users,
            self.spawn_failures,
            self.abandoned_users,
        )?;
        if self.metrics_lost {
            writeln!(f, "  per-transaction metrics lost: aggregator failed")?;
        }
        for t in &self.transactions {
            writeln!(
                f,
                "  {}: pass={}, fail={}, aborted={}, mean={:?}, p90={:?}, p99={:?}",
                t.name, t.pass, t.fail, t.aborted, t.latency.mean, t.latency.p90, t.latency.p99
            )?;
        }
        Ok(())
    }
}

/// Latest aggregated view published by the metrics aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Run totals per transaction as of the last flush.
    pub transactions: Vec<TransactionSummary>,
    /// Samples closed by the most recent flush.
    pub latest: Vec<MetricsSample>,
}

impl MetricsSnapshot {
    pub fn transaction(&self, name: &str) -> Option<&TransactionSummary> {
        self.transactions.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_counts_aborted() {
        let stats = RunStatistics {
            pass_count: 6,
            fail_count: 1,
            aborted_count: 1,
            ..Default::default()
        };
        assert_eq!(stats.total(), 8);
        assert_eq!(stats.error_rate(), 0.25);
        assert_eq!(RunStatistics::default().error_rate(), 0.);
    }

    #[test]
    fn status_display() {
        let status = RunStatus {
            elapsed: std::time::Duration::from_secs(65),
            live_users: 50,
            pass_count: 10,
            fail_count: 2,
            aborted_count: 0,
        };
        assert_eq!(
            status.to_string(),
            "elapsed=1m 5s, users=50, pass=10, fail=2, aborted=0"
        );
    }
}
