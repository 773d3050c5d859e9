//! The [`ConsumptionStore`] trait and its key type.

use crate::StorageError;
use alloy_primitives::B256;
use async_trait::async_trait;
use std::{collections::HashSet, fmt::Debug};

/// Identity of a consumed log broadcast.
///
/// A log is uniquely identified on-chain by `(block_hash, log_index)`; the
/// `job_id` scopes consumption to a single listener, so the same log may be
/// consumed independently by every listener interested in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumedLogKey {
    /// Hash of the block the log was included in.
    pub block_hash: B256,
    /// Index of the log within that block.
    pub log_index: u64,
    /// Stable identity of the consuming listener.
    pub job_id: String,
}

/// Durable record of which log broadcasts have been consumed, per listener.
///
/// `was_broadcast_consumed` and `mark_broadcast_consumed` MUST be called from
/// a single task per listener: the pair forms a read-modify-write sequence
/// and the store does not arbitrate between concurrent callers sharing a
/// `job_id`.
#[async_trait]
pub trait ConsumptionStore: Debug + Send + Sync {
    /// Reports whether the given listener has already consumed the given log.
    async fn was_broadcast_consumed(
        &self,
        block_hash: B256,
        log_index: u64,
        job_id: &str,
    ) -> Result<bool, StorageError>;

    /// Records that the given listener consumed the given log.
    ///
    /// Idempotent on `(block_hash, log_index, job_id)`: marking an
    /// already-consumed broadcast is a no-op, not an error.
    async fn mark_broadcast_consumed(
        &self,
        block_hash: B256,
        block_number: u64,
        log_index: u64,
        job_id: &str,
    ) -> Result<(), StorageError>;

    /// Returns every consumption recorded for a block in the inclusive range
    /// `[from_block, to_block]`.
    ///
    /// Used to suppress redelivery of backfilled logs after a restart.
    async fn find_consumed_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<HashSet<ConsumedLogKey>, StorageError>;
}
