//! Abstraction seams: the listener capability and the upstream log source.

use crate::{
    error::SourceError,
    types::{Broadcast, JobId, RawLog},
};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// A consumer of dispatched logs.
///
/// Implemented by each subsystem interested in on-chain events. The
/// broadcaster holds registered listeners behind shared handles and makes no
/// concurrency assumptions beyond [`handle_log`] returning promptly.
///
/// [`handle_log`]: LogListener::handle_log
pub trait LogListener: Send + Sync {
    /// Handles a dispatched broadcast.
    ///
    /// MUST NOT block: this is invoked on the broadcaster's control task.
    /// Long-running work belongs on the listener's own task; hand the
    /// [`Broadcast`] off and return.
    fn handle_log(&self, broadcast: Broadcast);

    /// The stable identity used for durable acknowledgement.
    fn job_id(&self) -> JobId;
}

/// Filter parameters for both live subscriptions and historical queries.
///
/// `topics` constrains `topics[0]` only (the event signature); finer-grained
/// per-position filtering happens during dispatch, not upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// First block of a historical query, inclusive. Unused for live
    /// subscriptions.
    pub from_block: Option<u64>,
    /// Last block of a historical query, inclusive. Unused for live
    /// subscriptions.
    pub to_block: Option<u64>,
    /// Emitting contract addresses to accept. Empty accepts any address.
    pub addresses: Vec<Address>,
    /// Event signature hashes to accept. Empty accepts any event.
    pub topics: Vec<B256>,
}

/// A live log stream handle.
///
/// Dropping the subscription tears down whatever upstream resources back it;
/// implementations attach the teardown via [`with_guard`].
///
/// [`with_guard`]: LogSubscription::with_guard
#[derive(Debug)]
pub struct LogSubscription {
    logs: mpsc::Receiver<RawLog>,
    errors: mpsc::Receiver<SourceError>,
    guard: Option<DropGuard>,
}

impl LogSubscription {
    /// Creates a subscription from its log and error streams.
    pub fn new(logs: mpsc::Receiver<RawLog>, errors: mpsc::Receiver<SourceError>) -> Self {
        Self { logs, errors, guard: None }
    }

    /// Attaches a guard whose drop cancels the upstream subscription task.
    #[must_use]
    pub fn with_guard(mut self, guard: DropGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Splits the subscription into its streams and teardown guard.
    pub(crate) fn into_parts(
        self,
    ) -> (mpsc::Receiver<RawLog>, mpsc::Receiver<SourceError>, Option<DropGuard>) {
        (self.logs, self.errors, self.guard)
    }
}

/// The upstream blockchain node, reduced to the three operations the
/// broadcaster needs.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait LogSource: Debug + Send + Sync {
    /// Opens a live log stream matching `filter`.
    async fn subscribe_filter_logs(&self, filter: &LogFilter)
        -> Result<LogSubscription, SourceError>;

    /// Fetches historical logs matching `filter`, in block order.
    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, SourceError>;

    /// The number of the current chain head.
    async fn latest_block_number(&self) -> Result<u64, SourceError>;
}
