//! Core data types for the log broadcaster.

use crate::{error::LogParseError, traits::LogListener};
use alloy_primitives::{Address, Bytes, B256};
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

/// A raw on-chain event log as delivered by the upstream provider.
///
/// Uniquely identified by `(block_hash, log_index)`. A log with
/// `removed = true` announces that a previously delivered log belongs to an
/// orphaned block; the removal is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// Address of the emitting contract.
    pub address: Address,
    /// Indexed event topics; `topics[0]` is the event signature hash.
    pub topics: Vec<B256>,
    /// ABI-encoded, non-indexed event data. Never interpreted here.
    pub data: Bytes,
    /// Number of the block the log was included in.
    pub block_number: u64,
    /// Hash of the block the log was included in.
    pub block_hash: B256,
    /// Hash of the transaction that emitted the log.
    pub tx_hash: B256,
    /// Index of that transaction within its block.
    pub tx_index: u64,
    /// Index of the log within its block.
    pub log_index: u64,
    /// True if the log was reverted by a chain reorganization.
    pub removed: bool,
}

impl RawLog {
    /// The event signature topic, if the log carries any topics.
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }

    /// The `(block_hash, log_index)` pair identifying this log.
    pub(crate) const fn identity(&self) -> (B256, u64) {
        (self.block_hash, self.log_index)
    }
}

/// A canonical chain head as reported by the external head tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    /// Block number of the head.
    pub number: u64,
    /// Block hash of the head.
    pub hash: B256,
    /// Hash of the head's parent block.
    pub parent_hash: B256,
    /// Length of the chain of heads the tracker has linked in memory.
    pub chain_length: u64,
}

/// Stable identity of a log consumer, used to scope durable acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{_0}")]
pub struct JobId(String);

impl JobId {
    /// Creates a job id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An opaque decoded event payload produced by a listener-supplied parser.
///
/// Listeners downcast to the concrete event type their parser produced.
pub type DecodedLog = Box<dyn Any + Send + Sync>;

/// A listener-supplied log parser, invoked once per dispatched log.
pub type ParseLogFn = Arc<dyn Fn(&RawLog) -> Result<DecodedLog, LogParseError> + Send + Sync>;

/// A log dispatched to a specific listener.
///
/// Created by the broadcaster at dispatch time, consumed (or dropped) by the
/// listener. Carries the identity required for durable acknowledgement via
/// [`mark_consumed`].
///
/// [`mark_consumed`]: crate::Broadcaster::mark_consumed
pub struct Broadcast {
    raw_log: RawLog,
    decoded: Option<DecodedLog>,
    job_id: JobId,
}

impl Broadcast {
    pub(crate) fn new(raw_log: RawLog, decoded: Option<DecodedLog>, job_id: JobId) -> Self {
        Self { raw_log, decoded, job_id }
    }

    /// The raw log this broadcast wraps.
    pub const fn raw_log(&self) -> &RawLog {
        &self.raw_log
    }

    /// The decoded payload, if the listener registered a parser.
    pub fn decoded_log(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.decoded.as_deref()
    }

    /// The listener identity this broadcast was dispatched to.
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl fmt::Debug for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("raw_log", &self.raw_log)
            .field("decoded", &self.decoded.as_ref().map(|_| "..."))
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// Options supplied by a listener at registration time.
#[derive(Clone)]
pub struct ListenerOpts {
    /// Address of the contract to receive logs for.
    pub contract: Address,
    /// Event topics to receive, with per-position value filters.
    ///
    /// Keyed by `topics[0]` (the event signature hash). The value gives, for
    /// topic positions `1..=3` in order, the set of accepted values at that
    /// position; an empty set means any value passes. Positions beyond the
    /// end of the list are unconstrained.
    pub logs_with_topics: HashMap<B256, Vec<Vec<B256>>>,
    /// Optional parser applied to each dispatched log.
    pub parse_log: Option<ParseLogFn>,
    /// Minimum confirmation depth (`head.number - log.block_number + 1`)
    /// a log must reach before it is dispatched to this listener.
    pub num_confirmations: u64,
}

impl fmt::Debug for ListenerOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOpts")
            .field("contract", &self.contract)
            .field("logs_with_topics", &self.logs_with_topics)
            .field("parse_log", &self.parse_log.as_ref().map(|_| "..."))
            .field("num_confirmations", &self.num_confirmations)
            .finish()
    }
}

/// A listener paired with its registration options.
///
/// Listener identity is the shared handle itself: two registrations refer to
/// the same listener iff they hold the same `Arc`.
#[derive(Clone)]
pub struct Registration {
    pub(crate) listener: Arc<dyn LogListener>,
    pub(crate) opts: ListenerOpts,
}

impl Registration {
    /// Creates a registration record.
    pub fn new(listener: Arc<dyn LogListener>, opts: ListenerOpts) -> Self {
        Self { listener, opts }
    }

    /// True if both registrations refer to the same listener handle.
    pub(crate) fn same_listener(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.listener, &other.listener)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("job_id", &self.listener.job_id())
            .field("opts", &self.opts)
            .finish()
    }
}
