use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::domain::{Decision, DecisionStage};
use crate::observability::metrics;
use crate::policy::RetryPolicy;

use super::record::LogRecord;
use super::sink::LogSink;

/// What `record` does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Evict the oldest buffered record
    DropOldest,
    /// Wait up to `timeout` for space, then drop the new record
    Block { timeout: Duration },
}

/// Decision logger settings.
#[derive(Debug, Clone, Copy)]
pub struct LoggerConfig {
    /// Maximum buffered records
    pub capacity: usize,

    /// Maximum records per delivered batch
    pub batch_size: usize,

    /// Flush a partial batch at least this often
    pub flush_interval: Duration,

    pub backpressure: Backpressure,

    /// Delivery retries before a batch is dropped
    pub retry: RetryPolicy,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            capacity: 10_000,
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
            backpressure: Backpressure::DropOldest,
            retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2)),
        }
    }
}

/// Logger counters.
///
/// Once the flusher has exited, `submitted == delivered + dropped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoggerStats {
    pub submitted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub pending: usize,
}

enum Push {
    Queued,
    Full(LogRecord),
    Closed,
}

struct Shared {
    queue: Mutex<VecDeque<LogRecord>>,
    config: LoggerConfig,
    /// Wakes the flusher early (full batch or close)
    ready: Notify,
    /// Wakes recorders waiting for space
    space: Notify,
    closed: AtomicBool,
    submitted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn drop_records(&self, reason: &'static str, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
        metrics::record_log_dropped(reason, count);
    }

    /// Push if there is room.
    ///
    /// `closed` is checked under the queue lock, which `close` also takes, so
    /// a queued record is always seen by the flusher's final drain.
    fn try_push(&self, record: LogRecord) -> Push {
        let mut queue = self.queue.lock();
        if self.closed.load(Ordering::Acquire) {
            return Push::Closed;
        }
        if queue.len() >= self.config.capacity {
            return Push::Full(record);
        }
        queue.push_back(record);
        if queue.len() >= self.config.batch_size {
            self.ready.notify_one();
        }
        Push::Queued
    }

    fn take_batch(&self) -> Vec<LogRecord> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(self.config.batch_size);
        queue.drain(..n).collect()
    }
}

/// Handle for recording decisions off the request path.
///
/// Records go into a bounded buffer drained by one background flusher that
/// batches, compresses and delivers them. Delivery problems are retried and
/// counted there; `record` never surfaces them.
#[derive(Clone)]
pub struct DecisionLogger {
    shared: Arc<Shared>,
}

impl DecisionLogger {
    /// Spawn the background flusher and return a `(logger, join_handle)` pair.
    pub fn start(sink: Arc<dyn LogSink>, config: LoggerConfig) -> (Self, JoinHandle<()>) {
        let config = LoggerConfig {
            capacity: config.capacity.max(1),
            batch_size: config.batch_size.max(1),
            ..config
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(65_536))),
            config,
            ready: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let handle = tokio::spawn(run_flusher(shared.clone(), sink));

        (DecisionLogger { shared }, handle)
    }

    /// Buffer a decision for delivery.
    ///
    /// Returns false if this decision was dropped.
    pub async fn record(&self, decision: &Decision) -> bool {
        let shared = &self.shared;
        shared.submitted.fetch_add(1, Ordering::Relaxed);

        if shared.closed.load(Ordering::Acquire) {
            shared.drop_records("closed", 1);
            return false;
        }

        let record = LogRecord::from_decision(decision);

        match shared.config.backpressure {
            Backpressure::DropOldest => {
                let mut queue = shared.queue.lock();
                if shared.closed.load(Ordering::Acquire) {
                    drop(queue);
                    shared.drop_records("closed", 1);
                    return false;
                }
                if queue.len() >= shared.config.capacity {
                    queue.pop_front();
                    shared.drop_records("overflow", 1);
                }
                queue.push_back(record);
                if queue.len() >= shared.config.batch_size {
                    shared.ready.notify_one();
                }
                true
            }
            Backpressure::Block { timeout } => {
                let deadline = Instant::now() + timeout;
                let mut record = record;

                loop {
                    let notified = shared.space.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    match shared.try_push(record) {
                        Push::Queued => return true,
                        Push::Full(returned) => record = returned,
                        Push::Closed => {
                            shared.drop_records("closed", 1);
                            return false;
                        }
                    }

                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!(decision_id = %decision.id, "Decision log full, record dropped");
                        shared.drop_records("timeout", 1);
                        return false;
                    }
                }
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            pending: self.shared.queue.lock().len(),
        }
    }

    /// Stop accepting records; the flusher drains the buffer and exits.
    pub fn close(&self) {
        {
            let _queue = self.shared.queue.lock();
            self.shared.closed.store(true, Ordering::Release);
        }
        self.shared.ready.notify_one();
        self.shared.space.notify_waiters();
    }
}

async fn run_flusher(shared: Arc<Shared>, sink: Arc<dyn LogSink>) {
    let mut ticker = interval(shared.config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.ready.notified() => {}
        }

        loop {
            let batch = shared.take_batch();
            if batch.is_empty() {
                break;
            }
            shared.space.notify_waiters();
            deliver_with_retry(&shared, sink.as_ref(), batch).await;
        }

        if shared.closed.load(Ordering::Acquire) && shared.queue.lock().is_empty() {
            debug!("Decision log flusher shutting down");
            return;
        }
    }
}

async fn deliver_with_retry(shared: &Shared, sink: &dyn LogSink, batch: Vec<LogRecord>) {
    let retry = shared.config.retry;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match sink.deliver(&batch).await {
            Ok(()) => {
                shared
                    .delivered
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                metrics::record_stage(DecisionStage::Delivered, batch.len());
                return;
            }
            Err(e) if attempt < retry.max_attempts => {
                warn!(attempt, records = batch.len(), error = %e, "Decision log delivery failed, retrying");
                tokio::time::sleep(retry.backoff(attempt)).await;
            }
            Err(e) => {
                error!(attempts = attempt, records = batch.len(), error = %e, "Decision log batch dropped");
                shared.drop_records("delivery", batch.len());
                return;
            }
        }
    }
}
