//! Error types for the metastore.

use pyrite_compaction::{CompactionError, StoreError};

/// Errors raised while applying a committed log entry.
///
/// Any error leaves the entry unapplied on this replica; the caller must
/// stop applying and recover through restore.
#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors surfaced to metastore clients.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("failed to apply command: {0}")]
    Apply(#[from] ApplyError),

    #[error("failed to encode command: {0}")]
    Codec(#[from] postcard::Error),

    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("not the leader")]
    NotLeader,

    #[error("no replica available")]
    Unavailable,
}
