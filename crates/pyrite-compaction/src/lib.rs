//! # pyrite-compaction: Compaction core of the `Pyrite` metastore
//!
//! Decides which blocks are merged together and hands the resulting jobs
//! to workers under fencing-token leases.
//!
//! ## Key Principles
//!
//! - **Deterministic**: state changes depend only on committed log entries,
//!   their index and their append time
//! - **Read then commit**: proposals never mutate shared state; only the
//!   apply path does
//! - **Rebuildable**: every in-memory structure can be restored from the
//!   store alone
//!
//! ## Architecture
//!
//! - [`block_queue`]: Arrival-ordered staging of blocks, batched per key
//! - [`compactor`]: Block admission, queue maintenance, tombstones
//! - [`planner`]: Cursor that turns staged blocks into job plans
//! - [`scheduler`]: Job states, leases and the [`Schedule`] proposal object
//! - [`strategy`]: Admission, flush and completion predicates
//! - [`store`]: Persistence traits and an in-memory store
//!
//! ## Example
//!
//! ```ignore
//! let plan_update = {
//!     let mut schedule = scheduler.new_schedule(&store, entry.index, entry.appended_at);
//!     let mut plan = compactor.new_plan(entry.appended_at);
//!     while let Some(job) = plan.create_job() {
//!         schedule.add_job(job);
//!     }
//!     schedule.assign_job()?;
//!     schedule.into_update()
//! };
//! // ...commit plan_update through the log, then on every replica:
//! let applied = scheduler.update_schedule(&mut tx, &plan_update)?;
//! ```

pub mod block_queue;
pub mod compactor;
pub mod config;
pub mod error;
pub mod metrics;
pub mod planner;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod tombstones;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use block_queue::{CompactionQueue, LevelStats, QueueStats};
pub use compactor::Compactor;
pub use config::{CompactorConfig, LevelConfig, SchedulerConfig};
pub use error::{CompactionError, StoreError};
pub use metrics::CompactionMetrics;
pub use planner::{Plan, job_name};
pub use scheduler::{AppliedSchedule, Schedule, Scheduler, SchedulerStats};
pub use store::{CompactionStore, InMemoryStore, JobStore, QueueStore, TombstoneStore};
pub use strategy::{CompactionStrategy, FlushReason, LevelStrategy};
pub use tombstones::TombstoneEntry;
