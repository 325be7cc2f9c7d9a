//! Turns staged blocks into job plans.
//!
//! A [`Plan`] walks the sealed batches of each level in arrival order,
//! lowest level first. At each batch it gathers the key's unvisited blocks
//! from that batch onward, up to the level's job size. A full candidate
//! becomes a job and the cursor stays on the batch, since it may still hold
//! blocks; a short one is abandoned and the cursor moves on. Blocks are
//! claimed for the lifetime of the plan only: nothing is removed from the
//! queue until the plan is committed.

use std::collections::HashSet;
use std::sync::RwLockReadGuard;
use std::time::Duration;

use pyrite_types::{BlockId, BlockTombstones, CompactionJobPlan, CompactionKey, Timestamp};

use crate::block_queue::BatchId;
use crate::compactor::CompactorState;
use crate::strategy::{CompactionStrategy, FlushReason, JobCandidate};

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Start,
    At(BatchId),
}

/// Planning cursor over a read-locked queue snapshot.
pub struct Plan<'a> {
    state: RwLockReadGuard<'a, CompactorState>,
    strategy: &'a dyn CompactionStrategy,
    cleanup_delay: Duration,
    now: Timestamp,
    level: usize,
    cursor: Cursor,
    visited: HashSet<(CompactionKey, BlockId)>,
    claimed: HashSet<String>,
}

impl std::fmt::Debug for Plan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("level", &self.level)
            .field("cursor", &self.cursor)
            .field("visited", &self.visited.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Plan<'a> {
    pub(crate) fn new(
        state: RwLockReadGuard<'a, CompactorState>,
        strategy: &'a dyn CompactionStrategy,
        cleanup_delay: Duration,
        now: Timestamp,
    ) -> Self {
        Self {
            state,
            strategy,
            cleanup_delay,
            now,
            level: 0,
            cursor: Cursor::Start,
            visited: HashSet::new(),
            claimed: HashSet::new(),
        }
    }

    /// Returns the next job, or `None` once every level is exhausted.
    pub fn create_job(&mut self) -> Option<CompactionJobPlan> {
        loop {
            let queue = self.state.queue.levels().get(self.level)?;
            let batch = match self.cursor {
                Cursor::Start => queue.batches().next(),
                Cursor::At(id) => queue.batch_view(id),
            };
            let Some(batch) = batch else {
                self.next_level();
                continue;
            };

            let key = batch.key();
            let max = self.strategy.max_blocks_per_job(key.level);
            let blocks: Vec<BlockId> = queue
                .blocks_from(batch.id())
                .filter(|id| !self.visited.contains(&(key.clone(), (*id).clone())))
                .take(max)
                .cloned()
                .collect();
            let candidate = JobCandidate {
                level: key.level,
                blocks: blocks.len(),
                seed: batch.flush_reason().unwrap_or(FlushReason::Size),
            };

            if !self.strategy.complete(candidate) {
                match batch.next() {
                    Some(next) => self.cursor = Cursor::At(next),
                    None => self.next_level(),
                }
                continue;
            }

            let key = key.clone();
            self.cursor = Cursor::At(batch.id());
            self.visited
                .extend(blocks.iter().map(|id| (key.clone(), id.clone())));
            let tombstones = self.claim_tombstones(&key);
            return Some(CompactionJobPlan {
                name: job_name(&key, &blocks),
                tenant: key.tenant,
                shard: key.shard,
                compaction_level: key.level,
                source_blocks: blocks,
                tombstones,
            });
        }
    }

    fn next_level(&mut self) {
        self.level += 1;
        self.cursor = Cursor::Start;
    }

    fn claim_tombstones(&mut self, key: &CompactionKey) -> Vec<BlockTombstones> {
        let tombstones: Vec<BlockTombstones> = self
            .state
            .tombstones
            .eligible(&key.tenant, key.shard, self.now, self.cleanup_delay)
            .filter(|entry| !self.claimed.contains(&entry.tombstones.name))
            .map(|entry| entry.tombstones.clone())
            .collect();
        self.claimed
            .extend(tombstones.iter().map(|t| t.name.clone()));
        tombstones
    }
}

/// Deterministic job name for a set of source blocks.
///
/// The name depends only on the key and the set of block IDs, so every
/// replica planning the same blocks arrives at the same name, and a block
/// set that was already planned is recognised on commit.
pub fn job_name(key: &CompactionKey, blocks: &[BlockId]) -> String {
    let mut sorted: Vec<&BlockId> = blocks.iter().collect();
    sorted.sort();

    let mut hasher = blake3::Hasher::new();
    hasher.update(&key.shard.to_le_bytes());
    hasher.update(&key.level.to_le_bytes());
    for id in sorted {
        hasher.update(id.as_str().as_bytes());
        hasher.update(&[0]);
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hasher.finalize().as_bytes()[..8]);

    format!(
        "{:016x}-T{}-S{}-L{}",
        u64::from_be_bytes(prefix),
        key.tenant,
        key.shard,
        key.level
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::compactor::Compactor;
    use crate::config::{CompactorConfig, LevelConfig};
    use crate::metrics::CompactionMetrics;
    use crate::store::InMemoryStore;
    use pyrite_types::{BlockMeta, CompactedBlocks, LogIndex};

    fn compactor(batch: usize, age_ms: u64, delay_ms: u64) -> Compactor {
        let config = CompactorConfig {
            levels: vec![LevelConfig::new(batch, age_ms), LevelConfig::new(batch, 0)],
            default_level: LevelConfig::new(batch, 0),
            max_compaction_level: 3,
            tombstone_cleanup_delay_ms: delay_ms,
        };
        Compactor::new(config, Arc::new(CompactionMetrics::new()))
    }

    fn add(c: &Compactor, store: &mut InMemoryStore, index: u64, id: &str, tenant: &str, level: u32) {
        c.add_block(
            store,
            LogIndex::new(index),
            Timestamp::from_millis(index),
            &BlockMeta::new(id, tenant, 1, level),
        )
        .expect("add_block");
    }

    fn all_jobs(c: &Compactor, now: Timestamp) -> Vec<CompactionJobPlan> {
        let mut plan = c.new_plan(now);
        std::iter::from_fn(|| plan.create_job()).collect()
    }

    fn sources(job: &CompactionJobPlan) -> Vec<&str> {
        job.source_blocks.iter().map(BlockId::as_str).collect()
    }

    #[test]
    fn full_batch_yields_one_job() {
        let c = compactor(3, 0, 0);
        let mut store = InMemoryStore::new();
        for (i, id) in ["1", "2", "3"].iter().enumerate() {
            add(&c, &mut store, i as u64 + 1, id, "t", 0);
        }
        let jobs = all_jobs(&c, Timestamp::EPOCH);
        assert_eq!(jobs.len(), 1);
        assert_eq!(sources(&jobs[0]), ["1", "2", "3"]);
        assert_eq!(jobs[0].name, job_name(&CompactionKey::new("t", 1, 0), &jobs[0].source_blocks));
        assert!(jobs[0].name.ends_with("-Tt-S1-L0"));
    }

    #[test]
    fn open_batches_are_not_planned() {
        let c = compactor(3, 0, 0);
        let mut store = InMemoryStore::new();
        add(&c, &mut store, 1, "1", "t", 0);
        add(&c, &mut store, 2, "2", "t", 0);
        assert!(all_jobs(&c, Timestamp::EPOCH).is_empty());
    }

    #[test]
    fn job_spans_later_batches_of_the_same_key() {
        let c = compactor(2, 0, 0);
        let mut store = InMemoryStore::new();
        for (i, id) in ["1", "2", "3", "4"].iter().enumerate() {
            add(&c, &mut store, i as u64 + 1, id, "t", 0);
        }
        // The job tops up from the key's next batch; "4" waits for more.
        c.planned(
            &mut store,
            &CompactionJobPlan {
                name: "x".into(),
                tenant: "t".into(),
                shard: 1,
                compaction_level: 0,
                source_blocks: vec![BlockId::from("2")],
                tombstones: vec![],
            },
        )
        .expect("planned");
        let jobs = all_jobs(&c, Timestamp::EPOCH);
        assert_eq!(jobs.len(), 1);
        assert_eq!(sources(&jobs[0]), ["1", "3"]);
    }

    #[test]
    fn blocks_are_never_planned_twice() {
        let c = compactor(2, 0, 0);
        let mut store = InMemoryStore::new();
        for i in 0..7u64 {
            add(&c, &mut store, i + 1, &format!("b{i}"), "t", 0);
        }
        let jobs = all_jobs(&c, Timestamp::EPOCH);
        assert_eq!(jobs.len(), 3);
        let mut seen = HashSet::new();
        for job in &jobs {
            for id in &job.source_blocks {
                assert!(seen.insert(id.clone()), "{id} planned twice");
            }
        }
    }

    #[test]
    fn levels_are_planned_lowest_first() {
        let c = compactor(2, 0, 0);
        let mut store = InMemoryStore::new();
        add(&c, &mut store, 1, "h1", "t", 1);
        add(&c, &mut store, 2, "h2", "t", 1);
        add(&c, &mut store, 3, "l1", "t", 0);
        add(&c, &mut store, 4, "l2", "t", 0);
        let levels: Vec<u32> = all_jobs(&c, Timestamp::EPOCH)
            .iter()
            .map(|j| j.compaction_level)
            .collect();
        assert_eq!(levels, [0, 1]);
    }

    #[test]
    fn aged_batch_yields_undersized_job() {
        let c = compactor(10, 50, 0);
        let mut store = InMemoryStore::new();
        add(&c, &mut store, 1, "a", "t", 0);
        // Appended 100ms after the batch opened: sealed by age.
        add(&c, &mut store, 101, "b", "t", 0);
        let jobs = all_jobs(&c, Timestamp::EPOCH);
        assert_eq!(jobs.len(), 1);
        assert_eq!(sources(&jobs[0]), ["a", "b"]);
    }

    #[test]
    fn short_size_batch_is_skipped_for_later_batches() {
        let c = compactor(2, 0, 0);
        let mut store = InMemoryStore::new();
        add(&c, &mut store, 1, "a1", "a", 0);
        add(&c, &mut store, 2, "a2", "a", 0);
        add(&c, &mut store, 3, "b1", "b", 0);
        add(&c, &mut store, 4, "b2", "b", 0);
        let a_plan = CompactionJobPlan {
            name: "x".into(),
            tenant: "a".into(),
            shard: 1,
            compaction_level: 0,
            source_blocks: vec![BlockId::from("a1")],
            tombstones: vec![],
        };
        c.planned(&mut store, &a_plan).expect("planned");

        let jobs = all_jobs(&c, Timestamp::EPOCH);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].tenant, "b");
    }

    #[test]
    fn eligible_tombstones_are_attached_once() {
        let c = compactor(2, 0, 100);
        let mut store = InMemoryStore::new();
        let done = CompactionJobPlan {
            name: "done".into(),
            tenant: "t".into(),
            shard: 1,
            compaction_level: 0,
            source_blocks: vec![BlockId::from("old")],
            tombstones: vec![],
        };
        let compacted = CompactedBlocks {
            tenant: "t".into(),
            shard: 1,
            source_blocks: vec![BlockId::from("old")],
            new_blocks: vec![],
        };
        c.compacted(&mut store, LogIndex::new(1), Timestamp::from_millis(0), &done, &compacted)
            .expect("compacted");
        for i in 0..4u64 {
            add(&c, &mut store, i + 2, &format!("b{i}"), "t", 0);
        }

        // Too young.
        let jobs = all_jobs(&c, Timestamp::from_millis(50));
        assert!(jobs.iter().all(|j| j.tombstones.is_empty()));

        let jobs = all_jobs(&c, Timestamp::from_millis(100));
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].tombstones.len(), 1);
        assert_eq!(jobs[0].tombstones[0].name, "done");
        assert!(jobs[1].tombstones.is_empty());
    }

    #[test]
    fn shared_block_ids_under_other_keys_are_planned() {
        let c = compactor(2, 0, 0);
        let mut store = InMemoryStore::new();
        add(&c, &mut store, 1, "x", "a", 0);
        add(&c, &mut store, 2, "y", "a", 0);
        add(&c, &mut store, 3, "x", "b", 0);
        add(&c, &mut store, 4, "y", "b", 0);
        let jobs = all_jobs(&c, Timestamp::EPOCH);
        let planned: Vec<(&str, Vec<&str>)> = jobs
            .iter()
            .map(|j| (j.tenant.as_str(), sources(j)))
            .collect();
        assert_eq!(planned, [("a", vec!["x", "y"]), ("b", vec!["x", "y"])]);
    }

    #[test]
    fn job_name_ignores_block_order() {
        let key = CompactionKey::new("t", 1, 0);
        let a = [BlockId::from("x"), BlockId::from("y")];
        let b = [BlockId::from("y"), BlockId::from("x")];
        assert_eq!(job_name(&key, &a), job_name(&key, &b));
        assert_ne!(job_name(&key, &a), job_name(&CompactionKey::new("t", 2, 0), &a));
        assert_ne!(job_name(&key, &a), job_name(&CompactionKey::new("t", 1, 1), &a));
    }
}
