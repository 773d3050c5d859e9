//! # vigil-storage
//!
//! Durable consumption tracking for the vigil log broadcaster.
//!
//! The broadcaster dispatches each on-chain event log at most once per
//! listener. The record of which `(block_hash, log_index, job_id)` tuples
//! have already been delivered and processed must survive node restarts, so
//! it lives in a relational store rather than in memory.
//!
//! ## Components
//!
//! - [`ConsumptionStore`]: the trait the broadcaster consumes. It is
//!   deliberately small: an existence check, an idempotent insert, and a
//!   block-range lookup used to suppress redelivery after a restart.
//! - [`PgConsumptionStore`]: the Postgres-backed implementation, built on
//!   [`sqlx`].
//! - [`MemoryConsumptionStore`]: an in-memory implementation for tests and
//!   ephemeral deployments.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod error;
pub use error::StorageError;

mod traits;
pub use traits::{ConsumedLogKey, ConsumptionStore};

mod pg;
pub use pg::PgConsumptionStore;

mod mem;
pub use mem::MemoryConsumptionStore;
