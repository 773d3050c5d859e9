//! Error types for the log broadcaster.

use thiserror::Error;

/// An error produced by the broadcaster's public API.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// `start` was called on an already-started broadcaster.
    #[error("log broadcaster is already started")]
    AlreadyStarted,
    /// `close` was called before `start`.
    #[error("log broadcaster has not been started")]
    NotStarted,
    /// `close` was called twice.
    #[error("log broadcaster is closed")]
    Closed,
    /// A listener registered with an empty topic map.
    #[error("listener registration requires at least one topic")]
    EmptyTopicFilters,
    /// The consumption store rejected an operation.
    #[error(transparent)]
    Storage(#[from] vigil_storage::StorageError),
    /// The operation was routed to a [`NullBroadcaster`].
    ///
    /// [`NullBroadcaster`]: crate::NullBroadcaster
    #[error("log broadcasting is disabled: {0}")]
    Disabled(String),
}

/// An error surfaced by the upstream log source.
///
/// All upstream failures are treated as transient: the broadcaster responds
/// by resubscribing with backoff, never by giving up.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The transport to the upstream node failed.
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// An established subscription was terminated by the upstream node.
    #[error("log subscription terminated: {0}")]
    Subscription(String),
}

/// A listener-supplied `parse_log` callback rejected a raw log.
#[derive(Debug, Error)]
#[error("failed to decode log: {0}")]
pub struct LogParseError(pub String);
