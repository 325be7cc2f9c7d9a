//! Compaction metrics.
//!
//! Counters are per level and lock-free. Gauges are not stored: they are
//! read from [`QueueStats`] and [`SchedulerStats`] at export time, so they
//! can never drift from the state they describe.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::block_queue::QueueStats;
use crate::scheduler::SchedulerStats;

/// Levels tracked individually; deeper levels share the last slot.
pub const MAX_TRACKED_LEVELS: usize = 16;

#[derive(Debug, Default)]
struct LevelCounters {
    blocks_added: AtomicU64,
    blocks_rejected: AtomicU64,
    jobs_added: AtomicU64,
    jobs_assigned: AtomicU64,
    jobs_reassigned: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_evicted: AtomicU64,
}

/// Counters shared by the compactor and the scheduler.
#[derive(Debug, Default)]
pub struct CompactionMetrics {
    levels: [LevelCounters; MAX_TRACKED_LEVELS],
}

impl CompactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn level(&self, level: u32) -> &LevelCounters {
        let i = (level as usize).min(MAX_TRACKED_LEVELS - 1);
        &self.levels[i]
    }

    pub fn record_block_added(&self, level: u32) {
        self.level(level).blocks_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_rejected(&self, level: u32) {
        self.level(level)
            .blocks_rejected
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_added(&self, level: u32) {
        self.level(level).jobs_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_assigned(&self, level: u32) {
        self.level(level).jobs_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_reassigned(&self, level: u32) {
        self.level(level)
            .jobs_reassigned
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self, level: u32) {
        self.level(level)
            .jobs_completed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_evicted(&self, level: u32) {
        self.level(level).jobs_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the counters of one level.
    pub fn snapshot(&self, level: u32) -> LevelMetricsSnapshot {
        let c = self.level(level);
        LevelMetricsSnapshot {
            blocks_added: c.blocks_added.load(Ordering::Relaxed),
            blocks_rejected: c.blocks_rejected.load(Ordering::Relaxed),
            jobs_added: c.jobs_added.load(Ordering::Relaxed),
            jobs_assigned: c.jobs_assigned.load(Ordering::Relaxed),
            jobs_reassigned: c.jobs_reassigned.load(Ordering::Relaxed),
            jobs_completed: c.jobs_completed.load(Ordering::Relaxed),
            jobs_evicted: c.jobs_evicted.load(Ordering::Relaxed),
        }
    }

    /// Renders counters and gauges in the Prometheus text format.
    pub fn export_prometheus(&self, queue: &QueueStats, scheduler: &SchedulerStats) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, fn(&LevelMetricsSnapshot) -> u64); 7] = [
            ("pyrite_compaction_blocks_added_total", "Blocks admitted to the queue", |s| s.blocks_added),
            ("pyrite_compaction_blocks_rejected_total", "Blocks refused by the strategy", |s| s.blocks_rejected),
            ("pyrite_compaction_jobs_added_total", "Jobs planned", |s| s.jobs_added),
            ("pyrite_compaction_jobs_assigned_total", "First assignments", |s| s.jobs_assigned),
            ("pyrite_compaction_jobs_reassigned_total", "Reassignments after lease expiry", |s| s.jobs_reassigned),
            ("pyrite_compaction_jobs_completed_total", "Jobs completed", |s| s.jobs_completed),
            ("pyrite_compaction_jobs_evicted_total", "Jobs cancelled after repeated failures", |s| s.jobs_evicted),
        ];
        let snapshots: Vec<LevelMetricsSnapshot> =
            (0..MAX_TRACKED_LEVELS as u32).map(|l| self.snapshot(l)).collect();

        for (name, help, read) in counters {
            let _ = write!(output, "# HELP {name} {help}\n# TYPE {name} counter\n");
            for (level, snapshot) in snapshots.iter().enumerate() {
                let value = read(snapshot);
                if value > 0 {
                    let _ = writeln!(output, "{name}{{level=\"{level}\"}} {value}");
                }
            }
        }

        output.push_str(
            "# HELP pyrite_compaction_staged_blocks Blocks waiting in the queue\n\
             # TYPE pyrite_compaction_staged_blocks gauge\n",
        );
        for level in &queue.levels {
            let _ = writeln!(
                output,
                "pyrite_compaction_staged_blocks{{level=\"{}\"}} {}",
                level.level, level.staged_blocks
            );
        }

        output.push_str(
            "# HELP pyrite_compaction_batches Batches by state\n\
             # TYPE pyrite_compaction_batches gauge\n",
        );
        for level in &queue.levels {
            let _ = write!(
                output,
                "pyrite_compaction_batches{{level=\"{0}\",state=\"sealed\"}} {1}\n\
                 pyrite_compaction_batches{{level=\"{0}\",state=\"open\"}} {2}\n",
                level.level, level.sealed_batches, level.open_batches
            );
        }

        output.push_str(
            "# HELP pyrite_compaction_jobs Queued jobs by status\n\
             # TYPE pyrite_compaction_jobs gauge\n",
        );
        for level in &scheduler.levels {
            let _ = write!(
                output,
                "pyrite_compaction_jobs{{level=\"{0}\",status=\"unassigned\"}} {1}\n\
                 pyrite_compaction_jobs{{level=\"{0}\",status=\"in_progress\"}} {2}\n",
                level.level, level.unassigned, level.in_progress
            );
        }

        output
    }
}

/// Counters of one level at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelMetricsSnapshot {
    pub blocks_added: u64,
    pub blocks_rejected: u64,
    pub jobs_added: u64,
    pub jobs_assigned: u64,
    pub jobs_reassigned: u64,
    pub jobs_completed: u64,
    pub jobs_evicted: u64,
}
