//! Test doubles for driving the broadcaster without a real chain.

use crate::{
    error::SourceError,
    traits::{LogFilter, LogListener, LogSource, LogSubscription},
    types::{Broadcast, JobId, RawLog},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_storage::{ConsumedLogKey, ConsumptionStore, MemoryConsumptionStore, StorageError};

/// A listener that records every broadcast it receives.
#[derive(Debug)]
pub struct TestListener {
    job_id: JobId,
    received: Mutex<Vec<RawLog>>,
}

impl TestListener {
    /// Creates a listener with the given job id.
    pub fn new(job_id: &str) -> Self {
        Self { job_id: JobId::from(job_id), received: Mutex::new(Vec::new()) }
    }

    /// Number of broadcasts received so far.
    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    /// The raw logs received so far, in dispatch order.
    pub fn received(&self) -> Vec<RawLog> {
        self.received.lock().clone()
    }
}

impl LogListener for TestListener {
    fn handle_log(&self, broadcast: Broadcast) {
        self.received.lock().push(broadcast.raw_log().clone());
    }

    fn job_id(&self) -> JobId {
        self.job_id.clone()
    }
}

#[derive(Debug)]
struct LiveSubscription {
    input_logs: mpsc::UnboundedSender<RawLog>,
    input_errors: mpsc::UnboundedSender<SourceError>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct TestSourceState {
    latest_block: u64,
    historical: Vec<RawLog>,
    live: Vec<LiveSubscription>,
    subscribe_filters: Vec<LogFilter>,
    filter_calls: Vec<LogFilter>,
    failing_subscribes: usize,
}

/// A scriptable in-process [`LogSource`].
///
/// Tests seed historical logs, push live logs and subscription errors, and
/// inspect the filters the broadcaster subscribed and backfilled with.
#[derive(Debug, Default)]
pub struct TestLogSource {
    state: Mutex<TestSourceState>,
}

impl TestLogSource {
    /// Creates a source with no history and a latest block of 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block number reported as the current head.
    pub fn set_latest_block(&self, block_number: u64) {
        self.state.lock().latest_block = block_number;
    }

    /// Seeds a log served by historical queries.
    pub fn add_historical_log(&self, log: RawLog) {
        self.state.lock().historical.push(log);
    }

    /// Pushes a log onto every live subscription.
    pub fn push_live_log(&self, log: RawLog) {
        let mut state = self.state.lock();
        state.live.retain(|sub| !sub.cancel.is_cancelled());
        for sub in &state.live {
            let _ = sub.input_logs.send(log.clone());
        }
    }

    /// Pushes an error onto every live subscription.
    pub fn push_subscription_error(&self, err: SourceError) {
        let mut state = self.state.lock();
        state.live.retain(|sub| !sub.cancel.is_cancelled());
        for sub in &state.live {
            let _ = sub.input_errors.send(err.clone());
        }
    }

    /// Makes the next `count` subscription attempts fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.state.lock().failing_subscribes = count;
    }

    /// Number of successful or failed subscription attempts so far.
    pub fn subscribe_count(&self) -> usize {
        self.state.lock().subscribe_filters.len()
    }

    /// Filters of every subscription attempt, in order.
    pub fn subscribe_filters(&self) -> Vec<LogFilter> {
        self.state.lock().subscribe_filters.clone()
    }

    /// Filters of every historical query, in order.
    pub fn filter_calls(&self) -> Vec<LogFilter> {
        self.state.lock().filter_calls.clone()
    }
}

#[async_trait]
impl LogSource for TestLogSource {
    async fn subscribe_filter_logs(
        &self,
        filter: &LogFilter,
    ) -> Result<LogSubscription, SourceError> {
        let mut state = self.state.lock();
        state.subscribe_filters.push(filter.clone());
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(SourceError::Transport("injected subscribe failure".to_owned()));
        }

        let (logs_tx, logs_rx) = mpsc::channel(64);
        let (errors_tx, errors_rx) = mpsc::channel(8);
        let (input_logs_tx, mut input_logs_rx) = mpsc::unbounded_channel();
        let (input_errors_tx, mut input_errors_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Per-subscription forwarder. When the subscription guard drops, the
        // token cancels, the task exits, and the output senders drop with it,
        // closing the subscription's streams the way a real unsubscribe does.
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    log = input_logs_rx.recv() => match log {
                        Some(log) => {
                            if logs_tx.send(log).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                    err = input_errors_rx.recv() => match err {
                        Some(err) => {
                            if errors_tx.send(err).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });

        state.live.push(LiveSubscription {
            input_logs: input_logs_tx,
            input_errors: input_errors_tx,
            cancel: cancel.clone(),
        });
        Ok(LogSubscription::new(logs_rx, errors_rx).with_guard(cancel.drop_guard()))
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, SourceError> {
        let mut state = self.state.lock();
        state.filter_calls.push(filter.clone());
        let from = filter.from_block.unwrap_or(0);
        let to = filter.to_block.unwrap_or(u64::MAX);
        Ok(state
            .historical
            .iter()
            .filter(|log| {
                (from..=to).contains(&log.block_number)
                    && (filter.addresses.is_empty() || filter.addresses.contains(&log.address))
                    && (filter.topics.is_empty()
                        || log.topic0().is_some_and(|topic| filter.topics.contains(&topic)))
            })
            .cloned()
            .collect())
    }

    async fn latest_block_number(&self) -> Result<u64, SourceError> {
        Ok(self.state.lock().latest_block)
    }
}

/// A [`ConsumptionStore`] whose range lookups can be made to fail, for
/// exercising the skip-dispatch-on-store-failure path.
#[derive(Debug, Default)]
pub struct FlakyConsumptionStore {
    inner: MemoryConsumptionStore,
    fail_finds: AtomicBool,
}

impl FlakyConsumptionStore {
    /// Creates an empty, healthy store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `find_consumed_logs` fail until turned off again.
    pub fn set_fail_finds(&self, fail: bool) {
        self.fail_finds.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsumptionStore for FlakyConsumptionStore {
    async fn was_broadcast_consumed(
        &self,
        block_hash: alloy_primitives::B256,
        log_index: u64,
        job_id: &str,
    ) -> Result<bool, StorageError> {
        self.inner.was_broadcast_consumed(block_hash, log_index, job_id).await
    }

    async fn mark_broadcast_consumed(
        &self,
        block_hash: alloy_primitives::B256,
        block_number: u64,
        log_index: u64,
        job_id: &str,
    ) -> Result<(), StorageError> {
        self.inner.mark_broadcast_consumed(block_hash, block_number, log_index, job_id).await
    }

    async fn find_consumed_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<std::collections::HashSet<ConsumedLogKey>, StorageError> {
        if self.fail_finds.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected find failure".to_owned()));
        }
        self.inner.find_consumed_logs(from_block, to_block).await
    }
}
