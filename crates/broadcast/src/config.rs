//! Configuration for the log broadcaster.

use serde::{Deserialize, Serialize};

/// Tunables governing backfill depth and log retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Extra blocks added below the highest confirmation requirement when
    /// computing the backfill start after a restart. Covers heads that were
    /// saved by the head tracker but not yet processed here.
    pub block_backfill_depth: u64,
    /// When true, skip the deep backfill on restart and rely on the live
    /// subscription alone. Earlier chain events may be missed.
    pub block_backfill_skip: bool,
    /// Minimum retention depth of the unconfirmed log pool, independent of
    /// listener confirmation requirements.
    pub finality_depth: u32,
    /// Number of blocks per historical log query during backfill.
    pub backfill_batch_size: u32,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            block_backfill_depth: 10,
            block_backfill_skip: false,
            finality_depth: 50,
            backfill_batch_size: 100,
        }
    }
}
