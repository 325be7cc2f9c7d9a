//! Error types for the compaction core.
//!
//! Only persistence failures are errors. Logical rejections (a duplicate
//! block, a level above the cutoff, a stale fencing token) are reported
//! through `bool`/`Option` return values.

/// Errors raised by a [`crate::store`] implementation.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: postcard::Error,
    },

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: postcard::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur while applying compaction state transitions.
#[derive(thiserror::Error, Debug)]
pub enum CompactionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
