//! Background flush executor
//!
//! Drains appended entries into the durable store without ever blocking the
//! append path.
//!
//! ```text
//!            first append           count | size | linger | manual
//!   IDLE ──────────────→ ACCUMULATING ─────────────────────────→ FLUSHING
//!    ▲                                                              │
//!    └──────────────── batch written (or retries exhausted) ────────┘
//! ```
//!
//! The linger deadline is set on entry into ACCUMULATING and is not pushed
//! back by later appends, so a single entry waits at most
//! `linger + batch write time`.

pub mod alert;
pub mod policy;

pub use alert::{AlertSink, ChannelAlertSink, FlushFailure, LogAlertSink};
pub use policy::{FlushPolicy, FlushTrigger};

use crate::error::{Error, Result};
use crate::metrics;
use crate::ring::{DrainBuffer, Entry, Pending, RingBuffer, SlotArray};
use crate::storage::{DurableStore, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Executor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FlushState {
    Idle = 0,
    Accumulating = 1,
    Flushing = 2,
}

impl FlushState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FlushState::Accumulating,
            2 => FlushState::Flushing,
            _ => FlushState::Idle,
        }
    }
}

/// Cumulative flush progress, published after every batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushProgress {
    pub batches: u64,
    pub entries_flushed: u64,
    pub last_flushed_offset: Option<u64>,
    pub last_trigger: Option<FlushTrigger>,
    pub retries: u64,
    pub failed_batches: u64,
    pub overwritten_unflushed: u64,
}

#[derive(Default)]
struct FlushCounters {
    batches: AtomicU64,
    entries_flushed: AtomicU64,
    retries: AtomicU64,
    failed_batches: AtomicU64,
    overwritten_unflushed: AtomicU64,
}

struct FlushShared<S: SlotArray, D: DurableStore> {
    ring: Arc<RingBuffer<S>>,
    drain: Arc<DrainBuffer>,
    store: Arc<D>,
    policy: FlushPolicy,
    alert: Arc<dyn AlertSink>,
    notify: Notify,
    state: AtomicU8,
    manual: AtomicBool,
    shutdown: AtomicBool,
    counters: FlushCounters,
    progress: watch::Sender<FlushProgress>,
}

/// Handle to the background flush task
pub struct FlushExecutor<S: SlotArray, D: DurableStore> {
    shared: Arc<FlushShared<S, D>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: SlotArray, D: DurableStore> FlushExecutor<S, D> {
    /// Spawn the executor on the current tokio runtime
    pub fn spawn(
        ring: Arc<RingBuffer<S>>,
        drain: Arc<DrainBuffer>,
        store: Arc<D>,
        policy: FlushPolicy,
        alert: Arc<dyn AlertSink>,
    ) -> Self {
        let (progress, _) = watch::channel(FlushProgress::default());
        let shared = Arc::new(FlushShared {
            ring,
            drain,
            store,
            policy,
            alert,
            notify: Notify::new(),
            state: AtomicU8::new(FlushState::Idle as u8),
            manual: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            counters: FlushCounters::default(),
            progress,
        });

        info!(
            count_threshold = policy.count_threshold,
            size_threshold_bytes = policy.size_threshold_bytes,
            linger_ms = policy.linger.as_millis() as u64,
            "Starting flush executor"
        );
        let worker = tokio::spawn(run(shared.clone()));

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Called by the append path after recording a pending entry
    ///
    /// Wakes the executor when the batch opens or a threshold is crossed.
    /// Never blocks.
    #[inline]
    pub fn on_append(&self, pending: Pending) {
        if pending.is_first() || self.shared.policy.threshold_reached(pending).is_some() {
            self.shared.notify.notify_one();
        }
    }

    /// Flush whatever is pending without waiting for a trigger
    pub fn flush_now(&self) {
        self.shared.manual.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn state(&self) -> FlushState {
        FlushState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn policy(&self) -> &FlushPolicy {
        &self.shared.policy
    }

    /// Receiver that observes every completed batch
    pub fn subscribe(&self) -> watch::Receiver<FlushProgress> {
        self.shared.progress.subscribe()
    }

    pub fn progress(&self) -> FlushProgress {
        self.shared.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Flush everything pending and stop the task
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify.notify_one();

        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker
                .await
                .map_err(|e| Error::Internal(format!("Flush executor panicked: {}", e))),
            None => Ok(()),
        }
    }
}

impl<S: SlotArray, D: DurableStore> Drop for FlushExecutor<S, D> {
    fn drop(&mut self) {
        // Let a still-running task drain and exit on its own
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

async fn run<S: SlotArray, D: DurableStore>(shared: Arc<FlushShared<S, D>>) {
    loop {
        shared.set_state(FlushState::Idle);
        while shared.drain.is_empty(shared.ring.sequence())
            && !shared.shutdown_requested()
            && !shared.manual.load(Ordering::Acquire)
        {
            shared.notify.notified().await;
        }

        // Writers are quiesced before shutdown is requested, so the cursor
        // reaching the sequence means every accepted append is accounted for
        if shared.shutdown_requested() && shared.drain.is_empty(shared.ring.sequence()) {
            break;
        }

        shared.set_state(FlushState::Accumulating);
        let deadline = Instant::now() + shared.policy.linger;
        let trigger = loop {
            if shared.shutdown_requested() {
                break FlushTrigger::Shutdown;
            }
            if shared.manual.swap(false, Ordering::AcqRel) {
                break FlushTrigger::Manual;
            }
            let pending = shared.drain.pending(shared.ring.sequence());
            if let Some(trigger) = shared.policy.threshold_reached(pending) {
                break trigger;
            }

            tokio::select! {
                _ = sleep_until(deadline) => break FlushTrigger::Linger,
                _ = shared.notify.notified() => {}
            }
        };

        shared.set_state(FlushState::Flushing);
        if !shared.flush_batch(trigger).await {
            // Only unpublished offsets remain; let their writers finish
            tokio::task::yield_now().await;
        }
    }

    shared.set_state(FlushState::Idle);
    debug!("Flush executor stopped");
}

impl<S: SlotArray, D: DurableStore> FlushShared<S, D> {
    fn set_state(&self, state: FlushState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> FlushProgress {
        let previous = self.progress.borrow();
        FlushProgress {
            batches: self.counters.batches.load(Ordering::Acquire),
            entries_flushed: self.counters.entries_flushed.load(Ordering::Acquire),
            last_flushed_offset: previous.last_flushed_offset,
            last_trigger: previous.last_trigger,
            retries: self.counters.retries.load(Ordering::Acquire),
            failed_batches: self.counters.failed_batches.load(Ordering::Acquire),
            overwritten_unflushed: self.counters.overwritten_unflushed.load(Ordering::Acquire),
        }
    }

    /// Drain everything published since the last batch and persist it
    ///
    /// Returns false when the cursor could not move.
    async fn flush_batch(&self, trigger: FlushTrigger) -> bool {
        let drained = self.drain.take(&self.ring);
        metrics::PENDING_ENTRIES.set(self.drain.pending(self.ring.sequence()).count as i64);
        if drained.is_empty() {
            return false;
        }

        if drained.lost > 0 {
            self.counters
                .overwritten_unflushed
                .fetch_add(drained.lost, Ordering::AcqRel);
            metrics::OVERWRITTEN_UNFLUSHED_TOTAL.inc_by(drained.lost);
            warn!(
                lost = drained.lost,
                from = drained.from,
                until = drained.until,
                capacity = self.ring.capacity(),
                "Entries overwritten before flush"
            );
        }

        let batch: Vec<Entry> = drained
            .entries
            .iter()
            .map(|entry| Entry::clone(entry))
            .collect();
        let mut last_flushed = None;
        if !batch.is_empty() {
            let first_offset = batch[0].offset;
            let last_offset = batch[batch.len() - 1].offset;
            let timer = metrics::FLUSH_DURATION.start_timer();
            let result = self.insert_with_retry(&batch).await;
            timer.observe_duration();

            match result {
                Ok(retries) => {
                    self.counters.batches.fetch_add(1, Ordering::AcqRel);
                    self.counters
                        .entries_flushed
                        .fetch_add(batch.len() as u64, Ordering::AcqRel);
                    metrics::FLUSH_ENTRIES_TOTAL.inc_by(batch.len() as u64);
                    metrics::FLUSH_BATCHES_TOTAL
                        .with_label_values(&[trigger.as_str(), "ok"])
                        .inc();
                    last_flushed = Some(last_offset);
                    debug!(
                        %trigger,
                        entries = batch.len(),
                        bytes = drained.bytes,
                        first_offset,
                        last_offset,
                        retries,
                        "Flushed batch"
                    );
                }
                Err((err, attempts)) => {
                    self.counters.failed_batches.fetch_add(1, Ordering::AcqRel);
                    metrics::FLUSH_BATCHES_TOTAL
                        .with_label_values(&[trigger.as_str(), "failed"])
                        .inc();
                    self.alert.flush_failed(&FlushFailure {
                        first_offset,
                        last_offset,
                        entries: batch.len(),
                        attempts,
                        trigger,
                        error: err.to_string(),
                    });
                }
            }
        }

        let mut progress = self.snapshot();
        if last_flushed.is_some() {
            progress.last_flushed_offset = last_flushed;
        }
        progress.last_trigger = Some(trigger);
        self.progress.send_replace(progress);
        true
    }

    /// Insert with bounded retry; returns retries used, or the final error and attempt count
    async fn insert_with_retry(&self, batch: &[Entry]) -> std::result::Result<u32, (StorageError, u32)> {
        let mut retries = 0u32;
        loop {
            match self.store.batch_insert(batch).await {
                Ok(()) => {
                    if retries > 0 {
                        debug!(retries, entries = batch.len(), "Batch insert succeeded after retries");
                    }
                    return Ok(retries);
                }
                Err(err) => {
                    if err.is_retryable() && retries < self.policy.max_retries {
                        retries += 1;
                        self.counters.retries.fetch_add(1, Ordering::AcqRel);
                        metrics::FLUSH_RETRIES_TOTAL.inc();
                        let delay = self.policy.retry_delay(retries);
                        warn!(
                            attempt = retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying batch insert"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err((err, retries + 1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::AtomicSlots;
    use crate::storage::{FaultMode, MockStore};
    use bytes::Bytes;
    use std::time::Duration;

    struct Harness {
        ring: Arc<RingBuffer<AtomicSlots>>,
        drain: Arc<DrainBuffer>,
        store: MockStore,
        executor: FlushExecutor<AtomicSlots, MockStore>,
    }

    impl Harness {
        fn new(capacity: usize, policy: FlushPolicy) -> Self {
            let ring = Arc::new(RingBuffer::<AtomicSlots>::new(capacity).unwrap());
            let drain = Arc::new(DrainBuffer::new(capacity, 0));
            let store = MockStore::new();
            let executor = FlushExecutor::spawn(
                ring.clone(),
                drain.clone(),
                Arc::new(store.clone()),
                policy,
                Arc::new(LogAlertSink),
            );
            Self {
                ring,
                drain,
                store,
                executor,
            }
        }

        fn append(&self, payload_len: usize) -> u64 {
            let (offset, pending) = self.drain.track(payload_len, || {
                self.ring
                    .append(Bytes::new(), Bytes::from(vec![0u8; payload_len]))
            });
            self.executor.on_append(pending);
            offset
        }
    }

    fn policy(count: u64, linger: Duration) -> FlushPolicy {
        FlushPolicy {
            count_threshold: count,
            size_threshold_bytes: 1024 * 1024,
            linger,
            max_retries: 3,
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_executor_idle_until_append() {
        let harness = Harness::new(64, policy(10, Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.executor.state(), FlushState::Idle);
        assert_eq!(harness.store.insert_calls(), 0);
    }

    #[tokio::test]
    async fn test_executor_manual_flush() {
        let harness = Harness::new(64, policy(100, Duration::from_secs(10)));
        let mut rx = harness.executor.subscribe();
        for _ in 0..3 {
            harness.append(8);
        }

        harness.executor.flush_now();
        let progress = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|p| p.entries_flushed == 3),
        )
        .await
        .expect("manual flush should complete")
        .unwrap()
        .clone();

        assert_eq!(progress.last_trigger, Some(FlushTrigger::Manual));
        assert_eq!(progress.last_flushed_offset, Some(2));
        assert_eq!(harness.store.offsets(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_executor_counts_overwritten_entries() {
        // Capacity 4 and a huge threshold: 10 appends wrap before any flush
        let harness = Harness::new(4, policy(1000, Duration::from_secs(10)));
        for _ in 0..10 {
            harness.append(1);
        }
        harness.executor.shutdown().await.unwrap();

        let progress = harness.executor.progress();
        assert_eq!(progress.overwritten_unflushed, 6);
        assert_eq!(progress.entries_flushed, 4);
        assert_eq!(harness.store.offsets(), vec![6, 7, 8, 9]);
        assert!(!harness.executor.is_running());
    }

    #[tokio::test]
    async fn test_executor_retries_then_succeeds() {
        let harness = Harness::new(64, policy(5, Duration::from_secs(10)));
        harness.store.fail_next_inserts(2, FaultMode::BeforeWrite);
        let mut rx = harness.executor.subscribe();

        for _ in 0..5 {
            harness.append(4);
        }

        let progress = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|p| p.entries_flushed == 5),
        )
        .await
        .expect("flush should succeed after retries")
        .unwrap()
        .clone();

        assert_eq!(progress.retries, 2);
        assert_eq!(progress.failed_batches, 0);
        assert_eq!(harness.store.insert_calls(), 3);
        assert_eq!(harness.store.len(), 5);
    }

    #[tokio::test]
    async fn test_executor_gives_up_on_rejection() {
        let ring = Arc::new(RingBuffer::<AtomicSlots>::new(16).unwrap());
        let drain = Arc::new(DrainBuffer::new(16, 0));
        let store = MockStore::new();
        let (sink, mut failures) = ChannelAlertSink::new();
        let executor = FlushExecutor::spawn(
            ring.clone(),
            drain.clone(),
            Arc::new(store.clone()),
            policy(2, Duration::from_secs(10)),
            Arc::new(sink),
        );

        store.fail_next_inserts(1, FaultMode::Reject);
        for _ in 0..2 {
            let (_, pending) =
                drain.track(2, || ring.append(Bytes::new(), Bytes::from_static(b"xy")));
            executor.on_append(pending);
        }

        let failure = tokio::time::timeout(Duration::from_secs(2), failures.recv())
            .await
            .expect("failure should be reported")
            .expect("channel open");
        assert_eq!(failure.first_offset, 0);
        assert_eq!(failure.last_offset, 1);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.trigger, FlushTrigger::Count);

        // Entries stay readable from the ring after the failed flush
        assert!(ring.get(0).is_some());
        assert!(store.is_empty());
        executor.shutdown().await.unwrap();
        assert_eq!(executor.progress().failed_batches, 1);
    }
}
