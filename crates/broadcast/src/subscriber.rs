//! Wrapper over the upstream log source: live subscriptions and backfill.

use crate::{
    config::BroadcasterConfig,
    traits::{LogFilter, LogSource, LogSubscription},
    types::RawLog,
};
use alloy_primitives::{Address, B256};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// First retry delay after an upstream failure.
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Retry delays double up to this cap.
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Capacity of internally composed log channels.
const LOG_CHANNEL_CAPACITY: usize = 128;

/// Opens live subscriptions and pumps historical backfills against the
/// upstream log source.
///
/// Every operation treats upstream failure as transient: it retries with
/// capped exponential backoff and gives up only when shutdown is requested,
/// which all methods report by returning `None`.
#[derive(Debug)]
pub(crate) struct EthSubscriber {
    source: Arc<dyn LogSource>,
    config: BroadcasterConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EthSubscriber {
    pub(crate) const fn new(
        source: Arc<dyn LogSource>,
        config: BroadcasterConfig,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self { source, config, cancel, tracker }
    }

    /// Opens a live log subscription for the given filter, retrying until it
    /// succeeds. Returns `None` on shutdown.
    pub(crate) async fn create_subscription(
        &self,
        addresses: &[Address],
        topics: &[B256],
    ) -> Option<LogSubscription> {
        let filter = LogFilter {
            addresses: addresses.to_vec(),
            topics: topics.to_vec(),
            ..Default::default()
        };
        let mut backoff = RETRY_BACKOFF_INITIAL;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.source.subscribe_filter_logs(&filter).await {
                Ok(subscription) => {
                    debug!(
                        target: "log_broadcaster",
                        addresses = addresses.len(),
                        topics = topics.len(),
                        "Opened upstream log subscription"
                    );
                    return Some(subscription);
                }
                Err(err) => {
                    warn!(
                        target: "log_broadcaster",
                        %err,
                        retry_in = ?backoff,
                        "Failed to open upstream log subscription; retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                }
            }
        }
    }

    /// Streams historical logs from `from_block` up to the current head, in
    /// block order, in batches of `backfill_batch_size` blocks.
    ///
    /// With `from_block == None` no history is requested and the returned
    /// channel is already closed. Returns `None` on shutdown.
    pub(crate) async fn backfill_logs(
        &self,
        from_block: Option<u64>,
        addresses: &[Address],
        topics: &[B256],
    ) -> Option<mpsc::Receiver<RawLog>> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let Some(from_block) = from_block else {
            return Some(rx);
        };

        let mut backoff = RETRY_BACKOFF_INITIAL;
        let latest = loop {
            match self.source.latest_block_number().await {
                Ok(latest) => break latest,
                Err(err) => {
                    warn!(
                        target: "log_broadcaster",
                        %err,
                        retry_in = ?backoff,
                        "Failed to fetch the latest block number for backfill; retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                }
            }
        };

        let batch_size = u64::from(self.config.backfill_batch_size.max(1));
        debug!(
            target: "log_broadcaster",
            from_block,
            latest,
            batch_size,
            "Backfilling logs"
        );

        let source = self.source.clone();
        let cancel = self.cancel.clone();
        let base_filter = LogFilter {
            addresses: addresses.to_vec(),
            topics: topics.to_vec(),
            ..Default::default()
        };
        self.tracker.spawn(async move {
            let mut start = from_block;
            while start <= latest {
                let end = latest.min(start.saturating_add(batch_size - 1));
                let filter =
                    LogFilter { from_block: Some(start), to_block: Some(end), ..base_filter.clone() };

                let mut backoff = RETRY_BACKOFF_INITIAL;
                let logs = loop {
                    match source.filter_logs(&filter).await {
                        Ok(logs) => break logs,
                        Err(err) => {
                            warn!(
                                target: "log_broadcaster",
                                %err,
                                from = start,
                                to = end,
                                retry_in = ?backoff,
                                "Failed to fetch a backfill batch; retrying"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                        }
                    }
                };
                trace!(
                    target: "log_broadcaster",
                    from = start,
                    to = end,
                    count = logs.len(),
                    "Fetched backfill batch"
                );

                for log in logs {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(log) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }

                let Some(next) = end.checked_add(1) else { break };
                start = next;
            }
        });
        Some(rx)
    }

    /// Forwards every item of `first` to completion, then every item of
    /// `second`, closing the returned channel when both are drained. On
    /// shutdown the stream closes without blocking, dropping whatever
    /// remains.
    pub(crate) fn append_log_channel(
        &self,
        first: Option<mpsc::Receiver<RawLog>>,
        second: mpsc::Receiver<RawLog>,
    ) -> mpsc::Receiver<RawLog> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            for mut channel in first.into_iter().chain(std::iter::once(second)) {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        received = channel.recv() => match received {
                            Some(log) => {
                                if tx.send(log).await.is_err() {
                                    return;
                                }
                            }
                            None => break,
                        },
                    }
                }
            }
        });
        rx
    }
}
