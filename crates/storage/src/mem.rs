//! In-memory [`ConsumptionStore`] for tests and ephemeral deployments.

use crate::{ConsumedLogKey, ConsumptionStore, StorageError};
use alloy_primitives::B256;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// A [`ConsumptionStore`] backed by a process-local map.
///
/// Provides the same semantics as [`PgConsumptionStore`] without durability;
/// everything is lost when the process exits.
///
/// [`PgConsumptionStore`]: crate::PgConsumptionStore
#[derive(Debug, Clone, Default)]
pub struct MemoryConsumptionStore {
    // key -> block_number, for range lookups
    consumed: Arc<Mutex<HashMap<ConsumedLogKey, u64>>>,
}

impl MemoryConsumptionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded consumptions.
    pub fn len(&self) -> usize {
        self.consumed.lock().len()
    }

    /// True if nothing has been consumed yet.
    pub fn is_empty(&self) -> bool {
        self.consumed.lock().is_empty()
    }
}

#[async_trait]
impl ConsumptionStore for MemoryConsumptionStore {
    async fn was_broadcast_consumed(
        &self,
        block_hash: B256,
        log_index: u64,
        job_id: &str,
    ) -> Result<bool, StorageError> {
        let key = ConsumedLogKey { block_hash, log_index, job_id: job_id.to_owned() };
        Ok(self.consumed.lock().contains_key(&key))
    }

    async fn mark_broadcast_consumed(
        &self,
        block_hash: B256,
        block_number: u64,
        log_index: u64,
        job_id: &str,
    ) -> Result<(), StorageError> {
        let key = ConsumedLogKey { block_hash, log_index, job_id: job_id.to_owned() };
        self.consumed.lock().entry(key).or_insert(block_number);
        Ok(())
    }

    async fn find_consumed_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<HashSet<ConsumedLogKey>, StorageError> {
        Ok(self
            .consumed
            .lock()
            .iter()
            .filter(|(_, number)| (from_block..=to_block).contains(number))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
