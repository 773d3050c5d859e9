//! In-memory pool of logs awaiting confirmation depth.

use crate::types::RawLog;
use alloy_primitives::B256;
use std::collections::{BTreeMap, HashMap};

/// Buffers logs between receipt and dispatch.
///
/// Logs are indexed by block number, then by `(block_hash, log_index)`.
/// Inserting the same identity twice overwrites, which deduplicates logs
/// seen on both the backfill and the live stream. Logs are never returned
/// again after eviction.
#[derive(Debug, Default)]
pub(crate) struct LogPool {
    logs_by_block: BTreeMap<u64, HashMap<(B256, u64), RawLog>>,
}

impl LogPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a log, overwriting any prior entry with the same
    /// `(block_hash, log_index)`.
    pub(crate) fn add_log(&mut self, log: RawLog) {
        self.logs_by_block.entry(log.block_number).or_default().insert(log.identity(), log);
    }

    /// Erases the entry matching the log's `(block_hash, log_index)`, if any.
    pub(crate) fn remove_log(&mut self, log: &RawLog) {
        if let Some(in_block) = self.logs_by_block.get_mut(&log.block_number) {
            in_block.remove(&log.identity());
            if in_block.is_empty() {
                self.logs_by_block.remove(&log.block_number);
            }
        }
    }

    /// Returns every pooled log with `block_number <= latest_block_num`,
    /// sorted by `(block_number, tx_index, log_index)`, along with the lowest
    /// block number returned. Entries stay pooled; per-listener confirmation
    /// filtering happens at dispatch.
    pub(crate) fn logs_to_send(&self, latest_block_num: u64) -> (Vec<RawLog>, u64) {
        let mut logs = Vec::new();
        let mut min_block_num = 0;
        for (&block_number, in_block) in self.logs_by_block.range(..=latest_block_num) {
            if logs.is_empty() {
                min_block_num = block_number;
            }
            logs.extend(in_block.values().cloned());
        }
        sort_for_dispatch(&mut logs);
        (logs, min_block_num)
    }

    /// Drains the entire pool, returning the logs sorted for dispatch plus
    /// the lowest and highest block numbers drained. Used when every listener
    /// accepts zero confirmations.
    pub(crate) fn get_and_delete_all(&mut self) -> (Vec<RawLog>, u64, u64) {
        let mut lowest = 0;
        let mut highest = 0;
        let mut logs = Vec::new();
        for (block_number, in_block) in std::mem::take(&mut self.logs_by_block) {
            if logs.is_empty() {
                lowest = block_number;
            }
            highest = block_number;
            logs.extend(in_block.into_values());
        }
        sort_for_dispatch(&mut logs);
        (logs, lowest, highest)
    }

    /// Evicts every log with `block_number < keep_from`.
    pub(crate) fn delete_older_logs(&mut self, keep_from: u64) {
        self.logs_by_block = self.logs_by_block.split_off(&keep_from);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.logs_by_block.values().map(HashMap::len).sum()
    }
}

/// The dispatch order observable by listeners.
fn sort_for_dispatch(logs: &mut [RawLog]) {
    logs.sort_unstable_by_key(|log| (log.block_number, log.tx_index, log.log_index));
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes};

    fn log(block_number: u64, tx_index: u64, log_index: u64) -> RawLog {
        RawLog {
            address: Address::repeat_byte(0x01),
            topics: vec![B256::repeat_byte(0xaa)],
            data: Bytes::new(),
            block_number,
            block_hash: B256::repeat_byte(block_number as u8),
            tx_hash: B256::repeat_byte(0xcc),
            tx_index,
            log_index,
            removed: false,
        }
    }

    #[test]
    fn duplicate_identity_overwrites() {
        let mut pool = LogPool::new();
        pool.add_log(log(10, 0, 5));
        pool.add_log(log(10, 0, 5));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn remove_erases_matching_entry() {
        let mut pool = LogPool::new();
        pool.add_log(log(10, 0, 5));
        pool.remove_log(&log(10, 0, 5));
        assert_eq!(pool.len(), 0);

        // Removing an absent log is a no-op.
        pool.remove_log(&log(11, 0, 0));
    }

    #[test]
    fn logs_to_send_honors_cutoff_and_order() {
        let mut pool = LogPool::new();
        pool.add_log(log(12, 0, 0));
        pool.add_log(log(10, 1, 3));
        pool.add_log(log(10, 0, 7));
        pool.add_log(log(10, 1, 1));
        pool.add_log(log(15, 0, 0));

        let (logs, min_block) = pool.logs_to_send(12);
        assert_eq!(min_block, 10);
        let order: Vec<_> =
            logs.iter().map(|l| (l.block_number, l.tx_index, l.log_index)).collect();
        assert_eq!(order, vec![(10, 0, 7), (10, 1, 1), (10, 1, 3), (12, 0, 0)]);

        // Nothing was evicted.
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn logs_to_send_empty_below_cutoff() {
        let mut pool = LogPool::new();
        pool.add_log(log(20, 0, 0));
        let (logs, min_block) = pool.logs_to_send(19);
        assert!(logs.is_empty());
        assert_eq!(min_block, 0);
    }

    #[test]
    fn get_and_delete_all_drains_the_pool() {
        let mut pool = LogPool::new();
        pool.add_log(log(10, 0, 0));
        pool.add_log(log(12, 0, 1));
        pool.add_log(log(11, 2, 0));

        let (logs, lowest, highest) = pool.get_and_delete_all();
        assert_eq!((lowest, highest), (10, 12));
        assert_eq!(logs.len(), 3);
        assert!(logs.windows(2).all(|w| {
            (w[0].block_number, w[0].tx_index, w[0].log_index)
                <= (w[1].block_number, w[1].tx_index, w[1].log_index)
        }));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn delete_older_logs_evicts_strictly_below() {
        let mut pool = LogPool::new();
        pool.add_log(log(9, 0, 0));
        pool.add_log(log(10, 0, 0));
        pool.add_log(log(11, 0, 0));

        pool.delete_older_logs(10);
        let (logs, min_block) = pool.logs_to_send(u64::MAX);
        assert_eq!(min_block, 10);
        assert_eq!(logs.len(), 2);
    }
}
