use pdatastructs::tdigest::{TDigest, K1};
use serde::Serialize;
use serde_with::{serde_as, DurationMilliSecondsWithFrac};
use std::fmt;
use std::time::Duration;
use tracing::error;

const TDIGEST_BACKLOG_SIZE: usize = 100;

/// Outcome of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pass,
    Fail,
    /// The virtual user was abandoned while the transaction was in flight.
    Aborted,
}

/// What a virtual user reports to the aggregator for each transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub name: String,
    /// Offset from the start of the run at which the transaction finished.
    pub offset: Duration,
    pub latency: Duration,
    pub status: TransactionStatus,
}

/// Running latency distribution.
#[derive(Debug, Clone)]
pub struct LatencyDigest {
    digest: TDigest<K1>,
    count: u64,
    sum: Duration,
    min: Duration,
    max: Duration,
}

impl LatencyDigest {
    pub fn new() -> Self {
        Self {
            digest: default_tdigest(),
            count: 0,
            sum: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    pub fn insert(&mut self, latency: Duration) {
        // Whole microseconds keep centroid sums exact, so centroid means never drift
        // outside the inserted range.
        self.digest.insert(latency.as_micros() as f64);
        self.count += 1;
        self.sum += latency;
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn quantile(&self, quantile: f64) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        if self.min == self.max {
            return self.min;
        }

        let micros = self.digest.quantile(quantile.clamp(0., 1.));

        // TDigest can hand back NaN on degenerate inputs.
        let estimate = if micros.is_finite() && micros >= 0. {
            Duration::from_nanos((micros * 1_000.).round() as u64)
        } else {
            error!("Non-finite latency quantile ({quantile}); reporting the minimum.");
            self.min
        };

        estimate.clamp(self.min, self.max)
    }

    pub fn mean(&self) -> Duration {
        match self.count {
            0 => Duration::ZERO,
            count => Duration::from_nanos((self.sum.as_nanos() / count as u128) as u64),
        }
    }

    pub fn summary(&self) -> LatencySummary {
        if self.count == 0 {
            return LatencySummary::default();
        }

        LatencySummary {
            count: self.count,
            min: self.min,
            mean: self.mean(),
            max: self.max,
            p50: self.quantile(0.5),
            p90: self.quantile(0.9),
            p99: self.quantile(0.99),
        }
    }
}

impl Default for LatencyDigest {
    fn default() -> Self {
        Self::new()
    }
}

fn default_tdigest() -> TDigest<K1> {
    TDigest::new(K1::new(10.), TDIGEST_BACKLOG_SIZE)
}

#[serde_as]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub min: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub mean: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub max: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub p50: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub p90: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub p99: Duration,
}

/// Aggregated outcomes of one transaction over one time bucket.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSample {
    pub transaction: String,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub bucket_start: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub bucket_width: Duration,
    pub pass: u64,
    pub fail: u64,
    pub aborted: u64,
    pub latency: LatencySummary,
}

impl MetricsSample {
    pub fn total(&self) -> u64 {
        self.pass + self.fail + self.aborted
    }

    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.,
            total => (self.fail + self.aborted) as f64 / total as f64,
        }
    }

    pub fn tps(&self) -> f64 {
        self.total() as f64 / self.bucket_width.as_secs_f64()
    }
}

impl fmt::Display for MetricsSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}+{}] {}: pass={}, fail={}, aborted={}, TPS={:.2}, p50={:?}, p90={:?}, p99={:?}",
            humantime::format_duration(self.bucket_start),
            humantime::format_duration(self.bucket_width),
            self.transaction,
            self.pass,
            self.fail,
            self.aborted,
            self.tps(),
            self.latency.p50,
            self.latency.p90,
            self.latency.p99,
        )
    }
}
