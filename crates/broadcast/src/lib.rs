//! # vigil-broadcast
//!
//! A reorg-aware multiplexer for on-chain event-log subscriptions.
//!
//! ## Overview
//!
//! Every subsystem of a vigil node that reacts to contract events needs a
//! log subscription against the upstream chain node. Opening one per
//! subsystem would mean redundant RPC traffic, inconsistent reorg handling,
//! and no shared record of what was already delivered. The
//! [`LogBroadcaster`] instead consolidates every interested contract address
//! and event topic into a single upstream subscription and forwards each log
//! to the listeners it matches:
//!
//! - **One upstream subscription.** The union of all registered addresses
//!   and topics forms the upstream filter; bursts of register/unregister
//!   coalesce into a single resubscribe.
//! - **Backfill.** On every (re)connection, history is replayed from a start
//!   block derived from the last saved head and the deepest confirmation
//!   requirement, batched through the historical-query API.
//! - **Confirmation gating.** Logs are pooled until each listener's required
//!   confirmation depth is reached; a reorg that removes a pooled log
//!   suppresses its delivery entirely.
//! - **Durable acknowledgement.** Each dispatch is at-most-once per listener
//!   per process, and listeners record consumption through a
//!   [`ConsumptionStore`] so restarts never redeliver what was already
//!   processed.
//!
//! ## Architecture
//!
//! A single control task owns all mutable state (the unconfirmed log pool
//! and the registration index) and multiplexes over mailboxes fed by the
//! public handle:
//!
//! ```text
//! upstream subscription -> raw logs -> log pool (buffered by confirmations)
//!                                          |
//! head tracker -> new heads ------> dispatch pass -> listeners
//!                                          |
//!                                   consumption store
//! ```
//!
//! External callers interact through [`LogBroadcaster`], a cheap-to-clone
//! handle: [`Broadcaster::register`] for listeners,
//! [`Broadcaster::on_new_longest_chain`] for the head tracker, and
//! [`Broadcaster::replay_from_block`] to re-run history on demand.
//!
//! ## Features
//!
//! - `metrics`: Prometheus-compatible counters via the `metrics` facade.
//! - `test-utils`: scriptable test doubles and mock log sources.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

mod awaiter;
pub use awaiter::DependentAwaiter;

mod broadcaster;
pub use broadcaster::{Broadcaster, LogBroadcaster, NullBroadcaster, Unsubscriber};

mod config;
pub use config::BroadcasterConfig;

mod error;
pub use error::{BroadcastError, LogParseError, SourceError};

mod mailbox;
pub use mailbox::Mailbox;

/// Metrics identifiers and descriptions for the broadcaster.
pub mod metrics;

mod pool;

mod registrations;

mod subscriber;

mod traits;
pub use traits::{LogFilter, LogListener, LogSource, LogSubscription};
#[cfg(feature = "test-utils")]
pub use traits::MockLogSource;

mod types;
pub use types::{
    Broadcast, DecodedLog, Head, JobId, ListenerOpts, ParseLogFn, RawLog, Registration,
};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-exported for convenience: the storage seam the broadcaster consumes.
pub use vigil_storage::{ConsumedLogKey, ConsumptionStore, StorageError};
