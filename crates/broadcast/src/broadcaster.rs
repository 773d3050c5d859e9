//! The broadcaster core: lifecycle, resubscribe state machine, event loop,
//! and reorg-aware dispatch.

use crate::{
    awaiter::DependentAwaiter,
    config::BroadcasterConfig,
    error::{BroadcastError, SourceError},
    mailbox::Mailbox,
    pool::LogPool,
    registrations::Registrations,
    subscriber::EthSubscriber,
    traits::{LogListener, LogSource},
    types::{Broadcast, Head, ListenerOpts, RawLog, Registration},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::TaskTracker,
};
use vigil_storage::ConsumptionStore;

/// Warn when a received log's block number diverges from the most recently
/// seen head by more than this many blocks.
const MAX_LOG_HEAD_DIVERGENCE: u64 = 1000;

/// Bursts of register/unregister within this window coalesce into a single
/// upstream resubscribe.
const RESUBSCRIBE_DEBOUNCE: Duration = Duration::from_secs(1);

const STATE_IDLE: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// The log broadcaster's capability surface.
///
/// Consumers register listeners and acknowledge consumption; the external
/// head tracker feeds canonical heads in via [`on_new_longest_chain`].
///
/// `was_already_consumed` and `mark_consumed` MUST be invoked from a single
/// task per listener: together they form a read-modify-write sequence.
///
/// [`on_new_longest_chain`]: Broadcaster::on_new_longest_chain
#[async_trait]
pub trait Broadcaster: Debug + Send + Sync {
    /// Starts the broadcaster's control task. Errors if already started.
    fn start(&self) -> Result<(), BroadcastError>;

    /// Stops the broadcaster and waits for all of its tasks to exit.
    /// Errors if never started, or on a repeated close.
    async fn close(&self) -> Result<(), BroadcastError>;

    /// Registers a listener for logs matching `opts`.
    ///
    /// Rejects an empty `opts.logs_with_topics`. The returned handle removes
    /// the registration when explicitly invoked; dropping it changes
    /// nothing, so a registration never extends or depends on listener
    /// lifetime.
    fn register(
        &self,
        listener: Arc<dyn LogListener>,
        opts: ListenerOpts,
    ) -> Result<Unsubscriber, BroadcastError>;

    /// True while an upstream subscription is established.
    fn is_connected(&self) -> bool;

    /// Requests a backfill restarting from `block_number`. Non-blocking;
    /// a newer request overwrites an older one that has not been picked up.
    fn replay_from_block(&self, block_number: u64);

    /// Delivers a new canonical head. Only the most recent pending head is
    /// acted on; intermediate heads may be skipped under load.
    fn on_new_longest_chain(&self, head: Head);

    /// Head-tracker connection callback. No-op.
    fn connect(&self, head: &Head);

    /// Declares `count` startup dependents to wait for before the first
    /// subscribe.
    fn add_dependents(&self, count: usize);

    /// Signals that one startup dependent has registered its listeners.
    fn dependent_ready(&self);

    /// Reports whether this broadcast was already consumed by its listener.
    async fn was_already_consumed(&self, broadcast: &Broadcast) -> Result<bool, BroadcastError>;

    /// Durably records that the listener consumed this broadcast.
    async fn mark_consumed(&self, broadcast: &Broadcast) -> Result<(), BroadcastError>;

    /// The pending backfill start override, if any. Diagnostic.
    fn backfill_block_number(&self) -> Option<u64>;

    /// Number of contract addresses covered by the current upstream filter.
    /// Diagnostic.
    fn tracked_addresses_count(&self) -> u32;
}

/// State shared between the public handle and the control task.
#[derive(Debug)]
struct Shared {
    add_subscriber: Mailbox<Registration>,
    rm_subscriber: Mailbox<Registration>,
    new_heads: Mailbox<Head>,
    replay: Mailbox<u64>,
    awaiter: DependentAwaiter,
    cancel: CancellationToken,
    tracker: TaskTracker,
    state: AtomicU8,
    connected: AtomicBool,
    tracked_addresses_count: AtomicU32,
    last_seen_head_number: AtomicU64,
    backfill_block_number: Mutex<Option<u64>>,
}

/// Multiplexes log subscriptions for every listener over a single upstream
/// subscription.
///
/// Consolidates all interested contract addresses and topics into one
/// filter, backfills history on (re)connection, buffers logs until each
/// listener's confirmation depth is reached, and dispatches each log at most
/// once per listener with durable acknowledgement.
///
/// The type is a cheap-to-clone handle; [`start`] moves the log pool and
/// registration index into a single control task that owns all mutation, per
/// the concurrency model: external callers only touch mailboxes and atomics.
///
/// [`start`]: Broadcaster::start
#[derive(Debug, Clone)]
pub struct LogBroadcaster {
    shared: Arc<Shared>,
    store: Arc<dyn ConsumptionStore>,
    control: Arc<Mutex<Option<ControlTask>>>,
}

impl LogBroadcaster {
    /// Creates a stopped broadcaster.
    ///
    /// `highest_saved_head` is the most recent head persisted by the head
    /// tracker before this process started; it anchors the deep backfill on
    /// the first subscribe.
    pub fn new(
        source: Arc<dyn LogSource>,
        store: Arc<dyn ConsumptionStore>,
        config: BroadcasterConfig,
        highest_saved_head: Option<Head>,
    ) -> Self {
        let shared = Arc::new(Shared {
            add_subscriber: Mailbox::new(0),
            rm_subscriber: Mailbox::new(0),
            new_heads: Mailbox::new(1),
            replay: Mailbox::new(1),
            awaiter: DependentAwaiter::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            state: AtomicU8::new(STATE_IDLE),
            connected: AtomicBool::new(false),
            tracked_addresses_count: AtomicU32::new(0),
            last_seen_head_number: AtomicU64::new(0),
            backfill_block_number: Mutex::new(None),
        });
        let subscriber =
            EthSubscriber::new(source, config, shared.cancel.clone(), shared.tracker.clone());
        let control = ControlTask {
            shared: shared.clone(),
            store: store.clone(),
            subscriber,
            config,
            registrations: Registrations::new(),
            pool: LogPool::new(),
            highest_saved_head,
        };
        Self { shared, store, control: Arc::new(Mutex::new(Some(control))) }
    }
}

#[async_trait]
impl Broadcaster for LogBroadcaster {
    fn start(&self) -> Result<(), BroadcastError> {
        self.shared
            .state
            .compare_exchange(STATE_IDLE, STATE_STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| BroadcastError::AlreadyStarted)?;
        let Some(control) = self.control.lock().take() else {
            return Err(BroadcastError::AlreadyStarted);
        };
        info!(target: "log_broadcaster", "Starting the log broadcaster");
        self.shared.tracker.spawn(control.run());
        Ok(())
    }

    async fn close(&self) -> Result<(), BroadcastError> {
        if let Err(state) = self.shared.state.compare_exchange(
            STATE_STARTED,
            STATE_CLOSED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return match state {
                STATE_IDLE => Err(BroadcastError::NotStarted),
                _ => Err(BroadcastError::Closed),
            };
        }
        info!(target: "log_broadcaster", "Closing the log broadcaster");
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        Ok(())
    }

    fn register(
        &self,
        listener: Arc<dyn LogListener>,
        opts: ListenerOpts,
    ) -> Result<Unsubscriber, BroadcastError> {
        if opts.logs_with_topics.is_empty() {
            return Err(BroadcastError::EmptyTopicFilters);
        }
        let registration = Registration::new(listener, opts);
        if self.shared.add_subscriber.deliver(registration.clone()) {
            warn!(
                target: "log_broadcaster",
                "Subscription mailbox is over capacity - dropped the oldest unprocessed subscription"
            );
        }
        Ok(Unsubscriber { shared: Some(self.shared.clone()), registration: Some(registration) })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn replay_from_block(&self, block_number: u64) {
        info!(target: "log_broadcaster", block_number, "Replay requested");
        // Capacity-1 mailbox: a newer request replaces an unprocessed one.
        self.shared.replay.deliver(block_number);
    }

    fn on_new_longest_chain(&self, head: Head) {
        if self.shared.new_heads.deliver(head) {
            trace!(
                target: "log_broadcaster",
                latest_block_number = head.number,
                "Dropped an older head in the mailbox while inserting the latest (which is fine)"
            );
        }
    }

    fn connect(&self, _head: &Head) {}

    fn add_dependents(&self, count: usize) {
        self.shared.awaiter.add_dependents(count);
    }

    fn dependent_ready(&self) {
        self.shared.awaiter.dependent_ready();
    }

    async fn was_already_consumed(&self, broadcast: &Broadcast) -> Result<bool, BroadcastError> {
        let log = broadcast.raw_log();
        Ok(self
            .store
            .was_broadcast_consumed(log.block_hash, log.log_index, broadcast.job_id().as_str())
            .await?)
    }

    async fn mark_consumed(&self, broadcast: &Broadcast) -> Result<(), BroadcastError> {
        let log = broadcast.raw_log();
        Ok(self
            .store
            .mark_broadcast_consumed(
                log.block_hash,
                log.block_number,
                log.log_index,
                broadcast.job_id().as_str(),
            )
            .await?)
    }

    fn backfill_block_number(&self) -> Option<u64> {
        *self.shared.backfill_block_number.lock()
    }

    fn tracked_addresses_count(&self) -> u32 {
        self.shared.tracked_addresses_count.load(Ordering::SeqCst)
    }
}

/// Removes a listener registration when explicitly invoked.
///
/// Dropping the handle without calling [`unsubscribe`] leaves the
/// registration active; removal is never tied to listener lifetime.
///
/// [`unsubscribe`]: Unsubscriber::unsubscribe
#[derive(Debug)]
pub struct Unsubscriber {
    shared: Option<Arc<Shared>>,
    registration: Option<Registration>,
}

impl Unsubscriber {
    /// A handle that removes nothing, handed out by [`NullBroadcaster`].
    pub(crate) const fn noop() -> Self {
        Self { shared: None, registration: None }
    }

    /// Removes the registration this handle was created for.
    pub fn unsubscribe(mut self) {
        if let (Some(shared), Some(registration)) =
            (self.shared.take(), self.registration.take())
        {
            if shared.rm_subscriber.deliver(registration) {
                warn!(
                    target: "log_broadcaster",
                    "Subscription removal mailbox is over capacity - dropped the oldest unprocessed removal"
                );
            }
        }
    }
}

/// Why the event loop returned.
enum EventLoopExit {
    /// Tear the subscription down and build a new one.
    Resubscribe(Option<SourceError>),
    /// Shutdown was requested; exit for good.
    Shutdown,
}

/// The single task owning the log pool and the registration index.
#[derive(Debug)]
struct ControlTask {
    shared: Arc<Shared>,
    store: Arc<dyn ConsumptionStore>,
    subscriber: EthSubscriber,
    config: BroadcasterConfig,
    registrations: Registrations,
    pool: LogPool,
    highest_saved_head: Option<Head>,
}

impl ControlTask {
    async fn run(mut self) {
        if self.await_initial_subscribers().await {
            self.resubscribe_loop().await;
        }
    }

    /// Drains subscription mailboxes while waiting for every declared
    /// dependent to finish registering, so the first backfill depth accounts
    /// for all statically-known listeners. Returns false on shutdown.
    async fn await_initial_subscribers(&mut self) -> bool {
        let shared = self.shared.clone();
        loop {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return false,
                _ = shared.add_subscriber.notified() => { self.on_add_subscribers(); }
                _ = shared.rm_subscriber.notified() => { self.on_rm_subscribers(); }
                _ = shared.awaiter.await_dependents() => return true,
            }
        }
    }

    /// The subscription is torn down in two cases: intentionally, when the
    /// set of contracts being listened to changes, and on a subscription
    /// error. Both land back here, where the subscription is recreated and
    /// history is backfilled.
    async fn resubscribe_loop(&mut self) {
        let shared = self.shared.clone();
        let mut remaining_logs: Option<mpsc::Receiver<RawLog>> = None;
        let mut active_subscription: Option<DropGuard> = None;
        loop {
            debug!(target: "log_broadcaster", "Resubscribing and backfilling logs...");
            let (addresses, topics) = self.registrations.addresses_and_topics();

            let Some(subscription) =
                self.subscriber.create_subscription(&addresses, &topics).await
            else {
                return;
            };

            if self.config.block_backfill_skip && self.highest_saved_head.is_some() {
                warn!(
                    target: "log_broadcaster",
                    "BlockBackfillSkip is set to true, preventing a deep backfill - some earlier chain events might be missed"
                );
                self.highest_saved_head = None;
            }

            if let Some(saved_head) = self.highest_saved_head.take() {
                // The backfill must start below the head last saved to the
                // store: logs pooled in memory for up to the highest
                // confirmation requirement were lost with the old process,
                // and the head tracker may have saved heads this task never
                // processed. `block_backfill_depth` covers the latter.
                let from_block = saved_head
                    .number
                    .saturating_sub(self.registrations.highest_num_confirmations())
                    .saturating_sub(self.config.block_backfill_depth);
                self.set_backfill_block_number(Some(from_block));
            }

            let backfill_from = self.backfill_block_number();
            if let Some(block_number) = backfill_from {
                debug!(
                    target: "log_broadcaster",
                    block_number,
                    highest_num_confirmations = self.registrations.highest_num_confirmations(),
                    block_backfill_depth = self.config.block_backfill_depth,
                    "Using an override as the start of the backfill"
                );
            }

            let Some(backfilled) =
                self.subscriber.backfill_logs(backfill_from, &addresses, &topics).await
            else {
                return;
            };
            self.set_backfill_block_number(None);

            // Each cycle the raw-log input is reconstituted as:
            // remaining logs from the last subscription <- backfilled logs
            // <- logs from the new subscription. Duplicates are possible;
            // the pool deduplicates on (block_hash, log_index).
            let (live_logs, mut subscription_errors, guard) = subscription.into_parts();
            let combined = self.subscriber.append_log_channel(remaining_logs.take(), backfilled);
            let mut raw_logs = self.subscriber.append_log_channel(Some(combined), live_logs);

            // Dropping the previous guard unsubscribes the old stream.
            drop(active_subscription.take());
            active_subscription = guard;

            shared.connected.store(true, Ordering::SeqCst);
            shared.tracked_addresses_count.store(addresses.len() as u32, Ordering::SeqCst);
            #[cfg(feature = "metrics")]
            metrics::counter!(crate::metrics::RESUBSCRIBES).increment(1);

            match self.event_loop(&mut raw_logs, &mut subscription_errors).await {
                EventLoopExit::Resubscribe(maybe_err) => {
                    if let Some(err) = maybe_err {
                        warn!(
                            target: "log_broadcaster",
                            %err,
                            "Error in the event loop - will reconnect"
                        );
                    }
                    shared.connected.store(false, Ordering::SeqCst);
                    remaining_logs = Some(raw_logs);
                }
                EventLoopExit::Shutdown => {
                    shared.connected.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    async fn event_loop(
        &mut self,
        raw_logs: &mut mpsc::Receiver<RawLog>,
        subscription_errors: &mut mpsc::Receiver<SourceError>,
    ) -> EventLoopExit {
        let shared = self.shared.clone();
        let mut needs_resubscribe = false;
        let mut debounce = interval(RESUBSCRIBE_DEBOUNCE);
        debounce.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(target: "log_broadcaster", "Starting the event loop");
        loop {
            tokio::select! {
                biased;

                _ = shared.cancel.cancelled() => {
                    return EventLoopExit::Shutdown;
                }

                received = raw_logs.recv() => match received {
                    Some(log) => {
                        debug!(
                            target: "log_broadcaster",
                            block_number = log.block_number,
                            block_hash = ?log.block_hash,
                            address = ?log.address,
                            "Received a log"
                        );
                        self.on_new_log(log);
                    }
                    None => {
                        return EventLoopExit::Resubscribe(Some(SourceError::Subscription(
                            "log stream ended".to_owned(),
                        )));
                    }
                },

                _ = shared.new_heads.notified() => {
                    self.on_new_heads().await;
                }

                received = subscription_errors.recv() => {
                    // A message lands here when the upstream node terminates
                    // the connection.
                    return EventLoopExit::Resubscribe(Some(received.unwrap_or_else(|| {
                        SourceError::Subscription("error stream ended".to_owned())
                    })));
                }

                _ = shared.add_subscriber.notified() => {
                    needs_resubscribe = self.on_add_subscribers() || needs_resubscribe;
                }

                _ = shared.rm_subscriber.notified() => {
                    needs_resubscribe = self.on_rm_subscribers() || needs_resubscribe;
                }

                _ = shared.replay.notified() => {
                    if let Some(block_number) = shared.replay.retrieve_latest_and_clear() {
                        self.set_backfill_block_number(Some(block_number));
                        debug!(
                            target: "log_broadcaster",
                            block_number,
                            "Returning from the event loop to replay logs from a specific block number"
                        );
                        return EventLoopExit::Resubscribe(None);
                    }
                }

                _ = debounce.tick() => {
                    if needs_resubscribe {
                        debug!(
                            target: "log_broadcaster",
                            "Returning from the event loop to resubscribe"
                        );
                        return EventLoopExit::Resubscribe(None);
                    }
                }
            }
        }
    }

    fn on_new_log(&mut self, log: RawLog) {
        self.maybe_warn_on_large_block_number_difference(log.block_number);

        if log.removed {
            debug!(
                target: "log_broadcaster",
                block_number = log.block_number,
                log_index = log.log_index,
                "Removing a reorged log from the pool"
            );
            self.pool.remove_log(&log);
            return;
        }
        if !self.registrations.is_address_registered(&log.address) {
            return;
        }
        #[cfg(feature = "metrics")]
        metrics::counter!(crate::metrics::LOGS_RECEIVED).increment(1);
        self.pool.add_log(log);
    }

    /// Drives a dispatch pass against the most recent pending head.
    ///
    /// Heads may pile up faster than they are consumed; only the latest one
    /// matters because dispatch is based on the current head, not per-head.
    async fn on_new_heads(&mut self) {
        let Some(latest_head) = self.shared.new_heads.retrieve_latest_and_clear() else {
            return;
        };
        debug!(
            target: "log_broadcaster",
            block_number = latest_head.number,
            block_hash = ?latest_head.hash,
            parent_hash = ?latest_head.parent_hash,
            chain_length = latest_head.chain_length,
            "Received head"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!(crate::metrics::HEADS_PROCESSED).increment(1);

        self.shared.last_seen_head_number.store(latest_head.number, Ordering::Relaxed);

        let highest_num_confirmations = self.registrations.highest_num_confirmations();
        let kept_logs_depth =
            u64::from(self.config.finality_depth).max(highest_num_confirmations);
        let latest_block_num = latest_head.number;
        let kept_depth = latest_block_num.saturating_sub(kept_logs_depth);

        if highest_num_confirmations == 0 {
            // Every listener accepts zero confirmations: drain the pool
            // without comparing block numbers against the head.
            let (logs, lowest, highest) = self.pool.get_and_delete_all();
            if !logs.is_empty() {
                match self.store.find_consumed_logs(lowest, highest).await {
                    Ok(consumed) => {
                        self.registrations.send_logs(logs, latest_head, &consumed);
                    }
                    Err(err) => {
                        error!(
                            target: "log_broadcaster",
                            %err,
                            "Failed to query for consumed log broadcasts"
                        );
                    }
                }
            }
        } else {
            let (logs, min_block_num) = self.pool.logs_to_send(latest_block_num);
            if !logs.is_empty() {
                match self.store.find_consumed_logs(min_block_num, latest_block_num).await {
                    Ok(consumed) => {
                        self.registrations.send_logs(logs, latest_head, &consumed);
                    }
                    Err(err) => {
                        // Skip this pass rather than re-notify listeners the
                        // store may already know about. The logs stay pooled
                        // and the next head retries them.
                        error!(
                            target: "log_broadcaster",
                            %err,
                            "Failed to query for consumed log broadcasts"
                        );
                        return;
                    }
                }
            }
            self.pool.delete_older_logs(kept_depth);
        }
    }

    fn on_add_subscribers(&mut self) -> bool {
        let mut needs_resubscribe = false;
        while let Some(registration) = self.shared.add_subscriber.retrieve() {
            debug!(
                target: "log_broadcaster",
                address = ?registration.opts.contract,
                required_block_confirmations = registration.opts.num_confirmations,
                "Subscribing listener"
            );
            needs_resubscribe = self.registrations.add_subscriber(registration) || needs_resubscribe;
        }
        needs_resubscribe
    }

    fn on_rm_subscribers(&mut self) -> bool {
        let mut needs_resubscribe = false;
        while let Some(registration) = self.shared.rm_subscriber.retrieve() {
            debug!(
                target: "log_broadcaster",
                address = ?registration.opts.contract,
                required_block_confirmations = registration.opts.num_confirmations,
                "Unsubscribing listener"
            );
            needs_resubscribe =
                self.registrations.remove_subscriber(&registration) || needs_resubscribe;
        }
        needs_resubscribe
    }

    fn maybe_warn_on_large_block_number_difference(&self, log_block_number: u64) {
        let last_seen = self.shared.last_seen_head_number.load(Ordering::Relaxed);
        let diff = log_block_number.abs_diff(last_seen);
        if last_seen > 0 && diff > MAX_LOG_HEAD_DIVERGENCE {
            warn!(
                target: "log_broadcaster",
                last_seen_head_number = last_seen,
                log_block_number,
                diff,
                "Detected a large block number difference between a log and the recently seen head; this may indicate a problem with data received from the chain or major network delays"
            );
        }
    }

    fn set_backfill_block_number(&self, block_number: Option<u64>) {
        *self.shared.backfill_block_number.lock() = block_number;
    }

    fn backfill_block_number(&self) -> Option<u64> {
        *self.shared.backfill_block_number.lock()
    }
}

/// A no-op [`Broadcaster`] for deployments with log broadcasting disabled.
///
/// Registration and head delivery are silently accepted; consumption
/// tracking fails with the configured message so misrouted listeners surface
/// loudly.
#[derive(Debug, Clone)]
pub struct NullBroadcaster {
    error_message: String,
}

impl NullBroadcaster {
    /// Creates a null broadcaster whose consumption methods fail with
    /// `error_message`.
    pub fn new(error_message: impl Into<String>) -> Self {
        Self { error_message: error_message.into() }
    }
}

#[async_trait]
impl Broadcaster for NullBroadcaster {
    fn start(&self) -> Result<(), BroadcastError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), BroadcastError> {
        Ok(())
    }

    fn register(
        &self,
        _listener: Arc<dyn LogListener>,
        _opts: ListenerOpts,
    ) -> Result<Unsubscriber, BroadcastError> {
        Ok(Unsubscriber::noop())
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn replay_from_block(&self, _block_number: u64) {}

    fn on_new_longest_chain(&self, _head: Head) {}

    fn connect(&self, _head: &Head) {}

    fn add_dependents(&self, _count: usize) {}

    fn dependent_ready(&self) {}

    async fn was_already_consumed(&self, _broadcast: &Broadcast) -> Result<bool, BroadcastError> {
        Err(BroadcastError::Disabled(self.error_message.clone()))
    }

    async fn mark_consumed(&self, _broadcast: &Broadcast) -> Result<(), BroadcastError> {
        Err(BroadcastError::Disabled(self.error_message.clone()))
    }

    fn backfill_block_number(&self) -> Option<u64> {
        None
    }

    fn tracked_addresses_count(&self) -> u32 {
        0
    }
}
