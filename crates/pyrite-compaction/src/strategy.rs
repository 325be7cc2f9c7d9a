//! Pluggable admission, flush and completion predicates.

use std::fmt::Debug;

use pyrite_types::{BlockMeta, Timestamp};
use serde::{Deserialize, Serialize};

use crate::config::CompactorConfig;

/// Why a batch stopped accepting blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushReason {
    /// The batch reached its block threshold.
    Size,
    /// The batch's first block exceeded the level's maximum age.
    Age,
}

/// Shape of an open batch, as seen by [`CompactionStrategy::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub level: u32,
    /// Slots used, including removed ones.
    pub size: usize,
    pub created_at: Timestamp,
}

/// Shape of a job candidate, as seen by [`CompactionStrategy::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCandidate {
    pub level: u32,
    pub blocks: usize,
    /// How the batch that seeded the candidate was sealed.
    pub seed: FlushReason,
}

/// Decides which blocks enter the queue, when batches seal, and when a job
/// is large enough to run.
///
/// Implementations must be pure: the same inputs always yield the same
/// answer, on every replica.
pub trait CompactionStrategy: Debug + Send + Sync {
    /// Whether a block is admitted to the queue at all.
    fn can_compact(&self, block: &BlockMeta) -> bool;

    /// Whether an open batch should be sealed, given the append time of the
    /// block just added.
    fn flush(&self, batch: BatchInfo, now: Timestamp) -> Option<FlushReason>;

    /// Whether a job candidate should be emitted.
    fn complete(&self, job: JobCandidate) -> bool;

    /// Upper bound on a job's size at `level`.
    fn max_blocks_per_job(&self, level: u32) -> usize;
}

/// Per-level thresholds taken from [`CompactorConfig`].
#[derive(Debug, Clone)]
pub struct LevelStrategy {
    config: CompactorConfig,
}

impl LevelStrategy {
    pub fn new(config: CompactorConfig) -> Self {
        Self { config }
    }
}

impl CompactionStrategy for LevelStrategy {
    fn can_compact(&self, block: &BlockMeta) -> bool {
        block.compaction_level <= self.config.max_compaction_level
    }

    fn flush(&self, batch: BatchInfo, now: Timestamp) -> Option<FlushReason> {
        let level = self.config.level(batch.level);
        if batch.size >= level.max_blocks_per_batch {
            return Some(FlushReason::Size);
        }
        match level.max_batch_age() {
            Some(max_age) if now.saturating_since(batch.created_at) >= max_age => {
                Some(FlushReason::Age)
            }
            _ => None,
        }
    }

    fn complete(&self, job: JobCandidate) -> bool {
        if job.blocks >= self.max_blocks_per_job(job.level) {
            return true;
        }
        // An aged batch may run undersized so idle keys still drain.
        job.seed == FlushReason::Age && job.blocks > 0
    }

    fn max_blocks_per_job(&self, level: u32) -> usize {
        self.config.level(level).max_blocks_per_job
    }
}
