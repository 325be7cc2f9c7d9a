//! Compaction thresholds and scheduler limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CompactionError;

/// Thresholds for a single compaction level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// A batch is sealed once it holds this many blocks.
    pub max_blocks_per_batch: usize,
    /// A job is emitted once it holds this many blocks.
    pub max_blocks_per_job: usize,
    /// A batch is sealed once its first block is this old. Zero disables.
    pub max_batch_age_ms: u64,
}

impl LevelConfig {
    pub fn new(max_blocks: usize, max_batch_age_ms: u64) -> Self {
        Self {
            max_blocks_per_batch: max_blocks,
            max_blocks_per_job: max_blocks,
            max_batch_age_ms,
        }
    }

    pub fn max_batch_age(&self) -> Option<Duration> {
        (self.max_batch_age_ms > 0).then(|| Duration::from_millis(self.max_batch_age_ms))
    }
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self::new(10, 0)
    }
}

/// Configuration of block admission and planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorConfig {
    /// Per-level thresholds, indexed by compaction level.
    pub levels: Vec<LevelConfig>,
    /// Thresholds for levels without an explicit entry.
    pub default_level: LevelConfig,
    /// Blocks above this level are never compacted again.
    pub max_compaction_level: u32,
    /// Tombstones are handed out for physical deletion only after this delay.
    pub tombstone_cleanup_delay_ms: u64,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                LevelConfig::new(20, 60_000),
                LevelConfig::new(10, 5 * 60_000),
                LevelConfig::new(10, 15 * 60_000),
            ],
            default_level: LevelConfig::default(),
            max_compaction_level: 3,
            tombstone_cleanup_delay_ms: 15 * 60_000,
        }
    }
}

impl CompactorConfig {
    /// Returns the thresholds for `level`.
    pub fn level(&self, level: u32) -> &LevelConfig {
        self.levels
            .get(level as usize)
            .unwrap_or(&self.default_level)
    }

    pub fn tombstone_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.tombstone_cleanup_delay_ms)
    }

    pub fn validate(&self) -> Result<(), CompactionError> {
        for (i, level) in self
            .levels
            .iter()
            .chain(std::iter::once(&self.default_level))
            .enumerate()
        {
            if level.max_blocks_per_batch == 0 || level.max_blocks_per_job == 0 {
                return Err(CompactionError::InvalidConfig(format!(
                    "level config #{i}: block thresholds must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of job leases and failure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Reassignments tolerated before a job is cancelled. Zero disables.
    pub max_failures: u32,
    /// Lease granted on assignment and on every keep-alive.
    pub lease_duration_ms: u64,
    /// Upper bound on queued jobs. Zero means unbounded.
    pub max_queue_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            lease_duration_ms: 15_000,
            max_queue_size: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn validate(&self) -> Result<(), CompactionError> {
        if self.lease_duration_ms == 0 {
            return Err(CompactionError::InvalidConfig(
                "lease duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
