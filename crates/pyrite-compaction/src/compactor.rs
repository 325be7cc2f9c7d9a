//! Block admission, queue maintenance and tombstone bookkeeping.
//!
//! Every mutating method is called from the log apply path, one entry at a
//! time. Each persists first and only then touches memory, so a store
//! failure leaves the in-memory queue as it was before the entry; the
//! replica then falls behind and recovers through [`Compactor::restore`].

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use pyrite_types::{
    BlockEntry, BlockId, BlockMeta, BlockTombstones, CompactedBlocks, CompactionJobPlan,
    CompactionKey, LogIndex, Timestamp,
};

use crate::block_queue::{CompactionQueue, QueueStats};
use crate::config::CompactorConfig;
use crate::error::CompactionError;
use crate::metrics::CompactionMetrics;
use crate::planner::Plan;
use crate::store::{QueueStore, TombstoneStore};
use crate::strategy::{CompactionStrategy, LevelStrategy};
use crate::tombstones::{TombstoneEntry, TombstoneQueue};

#[derive(Debug)]
pub(crate) struct CompactorState {
    pub(crate) queue: CompactionQueue,
    pub(crate) tombstones: TombstoneQueue,
}

/// Owner of the block queue and the tombstone queue.
#[derive(Debug)]
pub struct Compactor {
    config: CompactorConfig,
    strategy: Arc<dyn CompactionStrategy>,
    state: RwLock<CompactorState>,
    metrics: Arc<CompactionMetrics>,
}

impl Compactor {
    /// Creates a compactor using per-level thresholds from `config`.
    pub fn new(config: CompactorConfig, metrics: Arc<CompactionMetrics>) -> Self {
        let strategy = Arc::new(LevelStrategy::new(config.clone()));
        Self::with_strategy(config, strategy, metrics)
    }

    pub fn with_strategy(
        config: CompactorConfig,
        strategy: Arc<dyn CompactionStrategy>,
        metrics: Arc<CompactionMetrics>,
    ) -> Self {
        let state = CompactorState {
            queue: CompactionQueue::new(Arc::clone(&strategy)),
            tombstones: TombstoneQueue::new(),
        };
        Self {
            config,
            strategy,
            state: RwLock::new(state),
            metrics,
        }
    }

    // Only the apply thread writes, so a poisoned lock still guards
    // consistent state.
    fn read(&self) -> RwLockReadGuard<'_, CompactorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CompactorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a newly created block.
    ///
    /// Returns `Ok(false)` if the strategy rejects the block or the block is
    /// already staged; neither is an error.
    pub fn add_block<S: QueueStore + ?Sized>(
        &self,
        tx: &mut S,
        index: LogIndex,
        appended_at: Timestamp,
        block: &BlockMeta,
    ) -> Result<bool, CompactionError> {
        if !self.strategy.can_compact(block) {
            tracing::debug!(
                block = %block.id,
                level = block.compaction_level,
                "block not admitted for compaction"
            );
            self.metrics.record_block_rejected(block.compaction_level);
            return Ok(false);
        }

        let entry = BlockEntry {
            index,
            id: block.id.clone(),
            appended_at,
            tenant: block.tenant.clone(),
            shard: block.shard,
            level: block.compaction_level,
        };

        let mut state = self.write();
        if state.queue.contains(&entry.key(), &entry.id) {
            tracing::debug!(block = %entry.id, "block already staged");
            return Ok(false);
        }
        tx.store_entry(&entry)?;
        let accepted = state.queue.push(&entry);
        debug_assert!(accepted, "push rejected a block that was not staged");

        self.metrics.record_block_added(entry.level);
        Ok(true)
    }

    /// Returns true if every source block of `plan` is still staged.
    pub fn is_staged(&self, plan: &CompactionJobPlan) -> bool {
        let key = plan_key(plan);
        let state = self.read();
        plan.source_blocks
            .iter()
            .all(|id| state.queue.contains(&key, id))
    }

    /// Takes the source blocks of a committed plan out of the queue and
    /// claims the plan's tombstones.
    pub fn planned<S: QueueStore + TombstoneStore + ?Sized>(
        &self,
        tx: &mut S,
        plan: &CompactionJobPlan,
    ) -> Result<(), CompactionError> {
        let key = plan_key(plan);
        let mut state = self.write();

        for id in &plan.source_blocks {
            if let Some(index) = staged_index(&state.queue, &key, id) {
                tx.delete_entry(index, id)?;
            }
        }
        let claimed = claim_entries(&state.tombstones, plan, Some(&plan.name));
        for entry in &claimed {
            tx.store_tombstones(entry)?;
        }

        let removed = state.queue.remove(&key, &plan.source_blocks);
        for entry in claimed {
            state.tombstones.insert(entry);
        }
        tracing::debug!(
            job = %plan.name,
            blocks = removed.len(),
            tombstones = plan.tombstones.len(),
            "job planned"
        );
        Ok(())
    }

    /// Records the outcome of a successful job: tombstones the job cleaned
    /// up are dropped, and its source blocks become tombstones in turn.
    pub fn compacted<S: TombstoneStore + ?Sized>(
        &self,
        tx: &mut S,
        index: LogIndex,
        appended_at: Timestamp,
        plan: &CompactionJobPlan,
        compacted: &CompactedBlocks,
    ) -> Result<(), CompactionError> {
        let mut state = self.write();

        let cleaned: Vec<&str> = plan
            .tombstones
            .iter()
            .map(|t| t.name.as_str())
            .filter(|name| {
                state
                    .tombstones
                    .get(name)
                    .is_some_and(|e| e.claimed_by.as_deref() == Some(plan.name.as_str()))
            })
            .collect();
        for name in &cleaned {
            tx.delete_tombstones(name)?;
        }

        let created = (!compacted.source_blocks.is_empty()).then(|| TombstoneEntry {
            index,
            created_at: appended_at,
            tombstones: BlockTombstones {
                name: plan.name.clone(),
                tenant: plan.tenant.clone(),
                shard: plan.shard,
                compaction_level: plan.compaction_level,
                blocks: compacted.source_blocks.clone(),
            },
            claimed_by: None,
        });
        if let Some(entry) = &created {
            tx.store_tombstones(entry)?;
        }

        for name in cleaned {
            state.tombstones.remove(name);
        }
        if let Some(entry) = created {
            state.tombstones.insert(entry);
        }
        Ok(())
    }

    /// Releases the tombstones claimed by a job that will never complete.
    pub fn released<S: TombstoneStore + ?Sized>(
        &self,
        tx: &mut S,
        plan: &CompactionJobPlan,
    ) -> Result<(), CompactionError> {
        let mut state = self.write();
        let released: Vec<TombstoneEntry> = plan
            .tombstones
            .iter()
            .filter_map(|t| state.tombstones.get(&t.name))
            .filter(|e| e.claimed_by.as_deref() == Some(plan.name.as_str()))
            .map(|e| TombstoneEntry {
                claimed_by: None,
                ..e.clone()
            })
            .collect();
        for entry in &released {
            tx.store_tombstones(entry)?;
        }
        for entry in released {
            state.tombstones.insert(entry);
        }
        Ok(())
    }

    /// Rebuilds the queues from the store, replaying entries in log order.
    pub fn restore<S: QueueStore + TombstoneStore + ?Sized>(
        &self,
        tx: &S,
    ) -> Result<(), CompactionError> {
        let entries = tx.list_entries()?;
        let tombstones = tx.list_tombstones()?;

        let mut state = self.write();
        state.queue.clear();
        state.tombstones.clear();
        for entry in &entries {
            state.queue.push(entry);
        }
        let tombstone_count = tombstones.len();
        for entry in tombstones {
            state.tombstones.insert(entry);
        }
        tracing::info!(
            blocks = entries.len(),
            tombstones = tombstone_count,
            "compaction queue restored"
        );
        Ok(())
    }

    /// Starts a planning cursor over the current queue.
    ///
    /// `now` is the append time of the log entry driving the plan. The
    /// cursor holds a read lock until dropped.
    pub fn new_plan(&self, now: Timestamp) -> Plan<'_> {
        Plan::new(
            self.read(),
            self.strategy.as_ref(),
            self.config.tombstone_cleanup_delay(),
            now,
        )
    }

    pub fn stats(&self) -> QueueStats {
        self.read().queue.stats()
    }

    /// Live blocks of a key in arrival order.
    pub fn staged_blocks(&self, key: &CompactionKey) -> Vec<BlockId> {
        self.read().queue.staged_blocks(key)
    }

    /// All tombstone entries, by name.
    pub fn tombstones(&self) -> Vec<TombstoneEntry> {
        self.read().tombstones.iter().cloned().collect()
    }

    /// Runs `f` against the queues under the read lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&CompactionQueue, &TombstoneQueue) -> R) -> R {
        let state = self.read();
        f(&state.queue, &state.tombstones)
    }
}

fn plan_key(plan: &CompactionJobPlan) -> CompactionKey {
    CompactionKey::new(plan.tenant.clone(), plan.shard, plan.compaction_level)
}

fn staged_index(queue: &CompactionQueue, key: &CompactionKey, id: &BlockId) -> Option<LogIndex> {
    queue.level(key.level).and_then(|q| q.staged_index(key, id))
}

/// Copies of the plan's tombstone entries with their claim set to `job`.
fn claim_entries(
    tombstones: &TombstoneQueue,
    plan: &CompactionJobPlan,
    job: Option<&str>,
) -> Vec<TombstoneEntry> {
    plan.tombstones
        .iter()
        .filter_map(|t| tombstones.get(&t.name))
        .map(|e| TombstoneEntry {
            claimed_by: job.map(str::to_string),
            ..e.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LevelConfig;
    use crate::store::InMemoryStore;

    fn compactor(batch: usize) -> Compactor {
        let config = CompactorConfig {
            levels: vec![LevelConfig::new(batch, 0)],
            default_level: LevelConfig::new(batch, 0),
            max_compaction_level: 1,
            tombstone_cleanup_delay_ms: 0,
        };
        Compactor::new(config, Arc::new(CompactionMetrics::new()))
    }

    fn add(c: &Compactor, store: &mut InMemoryStore, index: u64, id: &str, level: u32) -> bool {
        c.add_block(
            store,
            LogIndex::new(index),
            Timestamp::from_millis(index),
            &BlockMeta::new(id, "t", 1, level),
        )
        .expect("add_block")
    }

    fn key(level: u32) -> CompactionKey {
        CompactionKey::new("t", 1, level)
    }

    fn plan(name: &str, blocks: &[&str], tombstones: Vec<BlockTombstones>) -> CompactionJobPlan {
        CompactionJobPlan {
            name: name.into(),
            tenant: "t".into(),
            shard: 1,
            compaction_level: 0,
            source_blocks: blocks.iter().map(|b| BlockId::from(*b)).collect(),
            tombstones,
        }
    }

    fn compacted(blocks: &[&str]) -> CompactedBlocks {
        CompactedBlocks {
            tenant: "t".into(),
            shard: 1,
            source_blocks: blocks.iter().map(|b| BlockId::from(*b)).collect(),
            new_blocks: vec![],
        }
    }

    #[test]
    fn add_block_persists_and_stages() {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        assert!(add(&c, &mut store, 1, "a", 0));
        assert_eq!(store.entry_count(), 1);
        assert_eq!(c.staged_blocks(&key(0)), [BlockId::from("a")]);
    }

    #[test]
    fn level_above_cutoff_is_a_noop() {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        assert!(!add(&c, &mut store, 1, "a", 2));
        assert_eq!(store.entry_count(), 0);
        assert_eq!(c.stats().staged_blocks(), 0);
    }

    #[test]
    fn duplicate_block_is_not_persisted_twice() {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        assert!(add(&c, &mut store, 1, "a", 0));
        assert!(!add(&c, &mut store, 2, "a", 0));
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn persistence_failure_leaves_queue_untouched() {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        store.set_fail_writes(true);
        let result = c.add_block(
            &mut store,
            LogIndex::new(1),
            Timestamp::EPOCH,
            &BlockMeta::new("a", "t", 1, 0),
        );
        assert!(matches!(result, Err(CompactionError::Store(_))));
        assert!(c.staged_blocks(&key(0)).is_empty());
    }

    #[test]
    fn planned_removes_sources_from_queue_and_store() {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        for (i, id) in ["1", "2", "3", "4"].iter().enumerate() {
            add(&c, &mut store, i as u64 + 1, id, 0);
        }
        let p = plan("job", &["1", "2", "3"], vec![]);
        assert!(c.is_staged(&p));
        c.planned(&mut store, &p).expect("planned");

        assert!(!c.is_staged(&p));
        assert_eq!(c.staged_blocks(&key(0)), [BlockId::from("4")]);
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn tombstone_lifecycle() {
        let c = compactor(3);
        let mut store = InMemoryStore::new();

        // Job A completes: its sources become tombstones named after it.
        let a = plan("job-a", &["1", "2"], vec![]);
        c.compacted(&mut store, LogIndex::new(10), Timestamp::EPOCH, &a, &compacted(&["1", "2"]))
            .expect("compacted");
        let entries = c.tombstones();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tombstones.name, "job-a");
        assert_eq!(store.tombstone_count(), 1);

        // Job B carries them: planning claims, completion deletes.
        let b = plan("job-b", &[], vec![entries[0].tombstones.clone()]);
        c.planned(&mut store, &b).expect("planned");
        assert_eq!(c.tombstones()[0].claimed_by.as_deref(), Some("job-b"));
        c.compacted(&mut store, LogIndex::new(11), Timestamp::EPOCH, &b, &compacted(&[]))
            .expect("compacted");
        assert!(c.tombstones().is_empty());
        assert_eq!(store.tombstone_count(), 0);
    }

    #[test]
    fn released_tombstones_become_eligible_again() {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        let a = plan("job-a", &["1"], vec![]);
        c.compacted(&mut store, LogIndex::new(1), Timestamp::EPOCH, &a, &compacted(&["1"]))
            .expect("compacted");
        let b = plan("job-b", &[], vec![c.tombstones()[0].tombstones.clone()]);
        c.planned(&mut store, &b).expect("planned");
        c.released(&mut store, &b).expect("released");
        assert_eq!(c.tombstones()[0].claimed_by, None);

        let fresh = compactor(3);
        fresh.restore(&store).expect("restore");
        assert_eq!(fresh.tombstones(), c.tombstones());
    }

    #[test]
    fn restore_replays_in_log_order() {
        let c = compactor(2);
        let mut store = InMemoryStore::new();
        for (i, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            add(&c, &mut store, i as u64 + 1, id, 0);
        }
        c.planned(&mut store, &plan("p", &["a", "b"], vec![])).expect("planned");

        let restored = compactor(2);
        restored.restore(&store).expect("restore");
        assert_eq!(restored.staged_blocks(&key(0)), c.staged_blocks(&key(0)));
        assert_eq!(restored.stats(), c.stats());
    }
}
