//! # pyrite-metastore: Replicated metadata state machine for `Pyrite`
//!
//! Applies committed log entries to the compaction core and the block
//! index, and serves compaction jobs to workers.
//!
//! ## Key Principles
//!
//! - **Apply is deterministic**: the outcome of an entry depends only on
//!   the entry, its index and append time, and the store
//! - **Proposals are read-only**: `GetCompactionPlanUpdate` computes a plan
//!   update; `UpdateCompactionPlan` revalidates and commits it
//! - **Fail, then restore**: a replica whose apply fails stops and rebuilds
//!   its state from the store
//!
//! ## Architecture
//!
//! - [`command`]: Replicated commands and their responses
//! - [`metastore`]: The state machine ([`Metastore::apply`])
//! - [`index`]: Live blocks per tenant and shard
//! - [`store`]: Persistence traits and an in-memory store
//! - [`service`]: Worker-facing [`CompactionService`] over a [`Raft`]
//! - [`local_log`]: In-process log driving several replicas

pub mod command;
pub mod error;
pub mod index;
pub mod local_log;
pub mod metastore;
pub mod service;
mod state_hash;
pub mod store;


// Re-export commonly used items
pub use command::{Command, LogEntry, PlanApplied, Response};
pub use error::{ApplyError, ServiceError};
pub use index::BlockIndex;
pub use local_log::LocalLog;
pub use metastore::Metastore;
pub use service::{
    CompactionService, PollCompactionJobsRequest, PollCompactionJobsResponse, Raft, ServiceConfig,
};
pub use store::{IndexStore, MemoryStore, MetastoreStore};
