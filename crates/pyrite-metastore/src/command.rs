//! Commands replicated through the log, and their results.

use pyrite_types::{
    BlockMeta, CompactionJob, CompactionJobStatusUpdate, CompactionPlanUpdate, LogIndex, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Position and append time of a committed entry.
///
/// This is everything the state machine learns about the log besides the
/// command itself; it stands in for both the clock and the fencing-token
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub appended_at: Timestamp,
}

impl LogEntry {
    pub fn new(index: LogIndex, appended_at: Timestamp) -> Self {
        Self { index, appended_at }
    }
}

/// Commands that can be committed to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Registers a newly written block and offers it for compaction.
    AddBlock { block: BlockMeta },

    /// Computes a plan update without changing any state.
    ///
    /// The entry's index is the fencing token of every job the update
    /// assigns, and its append time is the lease clock.
    GetCompactionPlanUpdate {
        status_updates: Vec<CompactionJobStatusUpdate>,
        assign_jobs_max: u32,
        /// Upper bound on jobs planned by this update. Zero means unbounded.
        new_jobs_max: u32,
    },

    /// Applies a plan update computed by an earlier entry.
    UpdateCompactionPlan { plan_update: CompactionPlanUpdate },
}

impl Command {
    pub fn add_block(block: BlockMeta) -> Self {
        Self::AddBlock { block }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AddBlock { .. } => "AddBlock",
            Self::GetCompactionPlanUpdate { .. } => "GetCompactionPlanUpdate",
            Self::UpdateCompactionPlan { .. } => "UpdateCompactionPlan",
        }
    }
}

/// Result of applying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    BlockAdded { accepted: bool },
    PlanUpdate(CompactionPlanUpdate),
    PlanApplied(PlanApplied),
}

/// Summary of an applied plan update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanApplied {
    /// Assignments that survived revalidation, ready to hand to workers.
    pub assigned_jobs: Vec<CompactionJob>,
    pub new_jobs: usize,
    pub updated_jobs: usize,
    pub completed_jobs: usize,
    pub evicted_jobs: usize,
}
