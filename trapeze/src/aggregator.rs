//! Single-writer metrics aggregation.
//!
//! Virtual users only ever send records down an unbounded channel and bump a few atomics.
//! One task owns every [`MetricsSample`] and publishes read-only snapshots through `ArcSwap`.
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, Instrument};
use trapeze_core::{
    LatencyDigest, MetricsSample, MetricsSnapshot, TransactionRecord, TransactionStatus,
    TransactionSummary,
};

/// Receives every closed metrics bucket.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, sample: &MetricsSample);
}

/// Logs samples at `info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn emit(&self, sample: &MetricsSample) {
        info!("{sample}");
    }
}

/// Keeps every sample in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    samples: Arc<Mutex<Vec<MetricsSample>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<MetricsSample> {
        match self.samples.lock() {
            Ok(samples) => samples.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsSink for MemorySink {
    fn emit(&self, sample: &MetricsSample) {
        match self.samples.lock() {
            Ok(mut samples) => samples.push(sample.clone()),
            Err(poisoned) => poisoned.into_inner().push(sample.clone()),
        }
    }
}

#[derive(Debug)]
enum Message {
    Record(TransactionRecord),
    /// Close every bucket that ends at or before this offset.
    Flush(Duration),
    Finish(oneshot::Sender<Report>),
}

#[derive(Debug, Default)]
pub(crate) struct Totals {
    pass: AtomicU64,
    fail: AtomicU64,
    aborted: AtomicU64,
}

impl Totals {
    /// `(pass, fail, aborted)`
    pub fn load(&self) -> (u64, u64, u64) {
        (
            self.pass.load(Ordering::Relaxed),
            self.fail.load(Ordering::Relaxed),
            self.aborted.load(Ordering::Relaxed),
        )
    }
}

/// Write half handed to every virtual user.
#[derive(Clone, Debug)]
pub(crate) struct Recorder {
    tx: mpsc::UnboundedSender<Message>,
    totals: Arc<Totals>,
}

impl Recorder {
    pub fn record(&self, record: TransactionRecord) {
        let counter = match record.status {
            TransactionStatus::Pass => &self.totals.pass,
            TransactionStatus::Fail => &self.totals.fail,
            TransactionStatus::Aborted => &self.totals.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        {
            let status = match record.status {
                TransactionStatus::Pass => "pass",
                TransactionStatus::Fail => "fail",
                TransactionStatus::Aborted => "aborted",
            };
            metrics::counter!(
                "trapeze_transactions_total",
                "transaction" => record.name.clone(),
                "status" => status
            )
            .increment(1);
            metrics::histogram!(
                "trapeze_transaction_latency_seconds",
                "transaction" => record.name.clone()
            )
            .record(record.latency.as_secs_f64());
        }

        if self.tx.send(Message::Record(record)).is_err() {
            debug!("Aggregator is gone; dropping record.");
        }
    }
}

/// Final output of the aggregator.
#[derive(Debug, Default)]
pub(crate) struct Report {
    pub samples: Vec<MetricsSample>,
    pub transactions: Vec<TransactionSummary>,
    /// False when the aggregator died before producing the report.
    pub complete: bool,
}

#[derive(Debug, Default)]
struct Window {
    pass: u64,
    fail: u64,
    aborted: u64,
    latency: LatencyDigest,
}

impl Window {
    fn consume(&mut self, record: &TransactionRecord) {
        match record.status {
            TransactionStatus::Pass => self.pass += 1,
            TransactionStatus::Fail => self.fail += 1,
            // Abandoned transactions have no meaningful latency.
            TransactionStatus::Aborted => {
                self.aborted += 1;
                return;
            }
        }
        self.latency.insert(record.latency);
    }

    fn summary(&self, name: &str) -> TransactionSummary {
        TransactionSummary {
            name: name.to_string(),
            pass: self.pass,
            fail: self.fail,
            aborted: self.aborted,
            latency: self.latency.summary(),
        }
    }
}

struct State {
    bucket_width: Duration,
    open: BTreeMap<(u64, String), Window>,
    /// Buckets below this index are closed.
    closed_before: u64,
    totals: HashMap<String, Window>,
    samples: Vec<MetricsSample>,
    sink: Option<Arc<dyn MetricsSink>>,
    snapshot: Arc<ArcSwap<MetricsSnapshot>>,
}

impl State {
    fn bucket_of(&self, offset: Duration) -> u64 {
        (offset.as_nanos() / self.bucket_width.as_nanos()) as u64
    }

    fn bucket_start(&self, bucket: u64) -> Duration {
        Duration::from_nanos((bucket as u128 * self.bucket_width.as_nanos()) as u64)
    }

    fn consume(&mut self, record: TransactionRecord) {
        // A record that lost the race with a flush lands in the oldest open bucket.
        let bucket = self.bucket_of(record.offset).max(self.closed_before);
        self.totals
            .entry(record.name.clone())
            .or_default()
            .consume(&record);
        self.open
            .entry((bucket, record.name.clone()))
            .or_default()
            .consume(&record);
    }

    /// Close buckets entirely before `cutoff` (a bucket index) and publish a snapshot.
    fn close_before(&mut self, cutoff: u64) {
        self.closed_before = self.closed_before.max(cutoff);
        let still_open = self.open.split_off(&(cutoff, String::new()));
        let closed = std::mem::replace(&mut self.open, still_open);

        let mut latest = Vec::with_capacity(closed.len());
        for ((bucket, name), window) in closed {
            let sample = MetricsSample {
                bucket_start: self.bucket_start(bucket),
                bucket_width: self.bucket_width,
                pass: window.pass,
                fail: window.fail,
                aborted: window.aborted,
                latency: window.latency.summary(),
                transaction: name,
            };
            if let Some(sink) = &self.sink {
                sink.emit(&sample);
            }
            latest.push(sample);
        }

        if latest.is_empty() {
            return;
        }

        trace!("Closed {} metrics samples", latest.len());
        self.samples.extend(latest.iter().cloned());
        self.snapshot.store(Arc::new(MetricsSnapshot {
            transactions: self.summaries(),
            latest,
        }));
    }

    fn summaries(&self) -> Vec<TransactionSummary> {
        let mut summaries: Vec<_> = self
            .totals
            .iter()
            .map(|(name, window)| window.summary(name))
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

/// Owner of the aggregation task.
pub(crate) struct Aggregator {
    tx: mpsc::UnboundedSender<Message>,
    totals: Arc<Totals>,
    snapshot: Arc<ArcSwap<MetricsSnapshot>>,
    handle: JoinHandle<()>,
}

impl Aggregator {
    pub fn spawn(bucket_width: Duration, sink: Option<Arc<dyn MetricsSink>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(ArcSwap::from_pointee(MetricsSnapshot::default()));

        let mut state = State {
            bucket_width,
            open: BTreeMap::new(),
            closed_before: 0,
            totals: HashMap::new(),
            samples: vec![],
            sink,
            snapshot: snapshot.clone(),
        };

        let handle = tokio::spawn(
            async move {
                while let Some(message) = rx.recv().await {
                    match message {
                        Message::Record(record) => state.consume(record),
                        Message::Flush(now) => {
                            let cutoff = state.bucket_of(now);
                            state.close_before(cutoff);
                        }
                        Message::Finish(reply) => {
                            state.close_before(u64::MAX);
                            let report = Report {
                                transactions: state.summaries(),
                                samples: std::mem::take(&mut state.samples),
                                complete: true,
                            };
                            let _ = reply.send(report);
                            return;
                        }
                    }
                }
            }
            .in_current_span(),
        );

        Self {
            tx,
            totals: Arc::new(Totals::default()),
            snapshot,
            handle,
        }
    }

    pub fn recorder(&self) -> Recorder {
        Recorder {
            tx: self.tx.clone(),
            totals: self.totals.clone(),
        }
    }

    pub fn totals(&self) -> Arc<Totals> {
        self.totals.clone()
    }

    pub fn snapshot(&self) -> Arc<ArcSwap<MetricsSnapshot>> {
        self.snapshot.clone()
    }

    pub fn flush(&self, now: Duration) {
        let _ = self.tx.send(Message::Flush(now));
    }

    /// Close every bucket and return the run's samples and per-transaction totals.
    ///
    /// Records sent before this call are always included.
    pub async fn finish(self) -> Report {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Message::Finish(reply_tx)).is_err() {
            error!("Aggregator exited early; metrics are lost.");
            return Report::default();
        }

        match reply_rx.await {
            Ok(report) => report,
            Err(_) => {
                match self.handle.await {
                    Err(err) if err.is_panic() => error!("Aggregator panicked: {err}"),
                    _ => error!("Aggregator exited without a report."),
                }
                Report::default()
            }
        }
    }
}
