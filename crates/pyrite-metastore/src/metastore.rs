//! The replicated state machine.
//!
//! [`Metastore::apply`] is called with each committed entry, in log order,
//! on every replica. Its outcome depends only on the entry and the store,
//! so replicas that apply the same log end in the same state.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use pyrite_compaction::{
    AppliedSchedule, CompactionMetrics, Compactor, CompactorConfig, Scheduler, SchedulerConfig,
};
use pyrite_types::{
    AssignedCompactionJob, BlockId, BlockMeta, CompactedBlocks, CompactionJob,
    CompactionJobStatusUpdate, CompactionKey, CompactionPlanUpdate,
};

use crate::command::{Command, LogEntry, PlanApplied, Response};
use crate::error::ApplyError;
use crate::index::BlockIndex;
use crate::store::MetastoreStore;

/// One replica's metadata state.
#[derive(Debug)]
pub struct Metastore {
    compactor: Compactor,
    scheduler: Scheduler,
    index: RwLock<BlockIndex>,
    metrics: Arc<CompactionMetrics>,
}

impl Metastore {
    pub fn new(compactor: CompactorConfig, scheduler: SchedulerConfig) -> Self {
        let metrics = Arc::new(CompactionMetrics::new());
        Self {
            compactor: Compactor::new(compactor, Arc::clone(&metrics)),
            scheduler: Scheduler::new(scheduler, Arc::clone(&metrics)),
            index: RwLock::new(BlockIndex::new()),
            metrics,
        }
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &CompactionMetrics {
        &self.metrics
    }

    pub(crate) fn index(&self) -> RwLockReadGuard<'_, BlockIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_mut(&self) -> RwLockWriteGuard<'_, BlockIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn block(&self, tenant: &str, shard: u32, id: &BlockId) -> Option<BlockMeta> {
        self.index().get(tenant, shard, id).cloned()
    }

    /// Renders metrics and current gauges in the Prometheus text format.
    pub fn export_metrics(&self) -> String {
        self.metrics
            .export_prometheus(&self.compactor.stats(), &self.scheduler.stats())
    }

    /// Applies a committed entry.
    ///
    /// An error means the entry was not applied; the store transaction must
    /// be discarded and the replica restored before it applies anything
    /// else.
    pub fn apply<S: MetastoreStore>(
        &self,
        tx: &mut S,
        entry: LogEntry,
        command: &Command,
    ) -> Result<Response, ApplyError> {
        tracing::trace!(index = %entry.index, command = command.name(), "applying entry");
        match command {
            Command::AddBlock { block } => {
                let accepted = self.add_block(tx, entry, block)?;
                Ok(Response::BlockAdded { accepted })
            }
            Command::GetCompactionPlanUpdate {
                status_updates,
                assign_jobs_max,
                new_jobs_max,
            } => {
                let update =
                    self.plan_update(tx, entry, status_updates, *assign_jobs_max, *new_jobs_max)?;
                Ok(Response::PlanUpdate(update))
            }
            Command::UpdateCompactionPlan { plan_update } => {
                let applied = self.update_plan(tx, entry, plan_update)?;
                Ok(Response::PlanApplied(applied))
            }
        }
    }

    /// Rebuilds all in-memory state from the store.
    pub fn restore<S: MetastoreStore>(&self, tx: &S) -> Result<(), ApplyError> {
        let blocks = tx.list_blocks()?;
        {
            let mut index = self.index_mut();
            index.clear();
            for block in blocks {
                index.insert(block);
            }
        }
        self.compactor.restore(tx)?;
        self.scheduler.restore(tx)?;
        Ok(())
    }

    fn add_block<S: MetastoreStore>(
        &self,
        tx: &mut S,
        entry: LogEntry,
        block: &BlockMeta,
    ) -> Result<bool, ApplyError> {
        if self.index().contains(&block.tenant, block.shard, &block.id) {
            tracing::debug!(block = %block.id, "block already registered");
            return Ok(false);
        }
        tx.store_block(block)?;
        self.compactor
            .add_block(tx, entry.index, entry.appended_at, block)?;
        self.index_mut().insert(block.clone());
        Ok(true)
    }

    /// Proposal side: reads state, never writes it.
    fn plan_update<S: MetastoreStore>(
        &self,
        tx: &S,
        entry: LogEntry,
        status_updates: &[CompactionJobStatusUpdate],
        assign_jobs_max: u32,
        new_jobs_max: u32,
    ) -> Result<CompactionPlanUpdate, ApplyError> {
        let mut schedule = self
            .scheduler
            .new_schedule(tx, entry.index, entry.appended_at);
        for update in status_updates {
            schedule.update_job(update)?;
        }

        {
            let mut plan = self.compactor.new_plan(entry.appended_at);
            let mut added = 0;
            while new_jobs_max == 0 || added < new_jobs_max {
                let Some(job) = plan.create_job() else {
                    break;
                };
                if schedule.add_job(job).is_some() {
                    added += 1;
                }
            }
        }

        for _ in 0..assign_jobs_max {
            if schedule.assign_job()?.is_none() {
                break;
            }
        }
        Ok(schedule.into_update())
    }

    /// Apply side: revalidates the update and commits what still holds.
    fn update_plan<S: MetastoreStore>(
        &self,
        tx: &mut S,
        entry: LogEntry,
        plan_update: &CompactionPlanUpdate,
    ) -> Result<PlanApplied, ApplyError> {
        let update = self.revalidate_new_jobs(plan_update);
        let applied = self.scheduler.update_schedule(tx, &update)?;

        for plan in &applied.new_jobs {
            self.compactor.planned(tx, plan)?;
        }
        for (plan, compacted) in &applied.completed_jobs {
            self.compactor
                .compacted(tx, entry.index, entry.appended_at, plan, compacted)?;
            self.replace_blocks(tx, entry, compacted)?;
        }
        for plan in &applied.evicted_jobs {
            self.compactor.released(tx, plan)?;
        }

        Ok(self.summarize(&applied))
    }

    /// Drops new jobs whose blocks are gone or claimed by an earlier job of
    /// the same update.
    fn revalidate_new_jobs(&self, plan_update: &CompactionPlanUpdate) -> CompactionPlanUpdate {
        let mut update = plan_update.clone();
        let mut claimed: HashSet<(CompactionKey, BlockId)> = HashSet::new();
        update.new_jobs.retain(|job| {
            let plan = &job.plan;
            let key = CompactionKey::new(plan.tenant.clone(), plan.shard, plan.compaction_level);
            let overlaps = plan
                .source_blocks
                .iter()
                .any(|id| claimed.contains(&(key.clone(), id.clone())));
            if overlaps || !self.compactor.is_staged(plan) {
                tracing::warn!(job = %plan.name, "job sources no longer staged, skipping");
                return false;
            }
            claimed.extend(plan.source_blocks.iter().map(|id| (key.clone(), id.clone())));
            true
        });
        update
    }

    fn replace_blocks<S: MetastoreStore>(
        &self,
        tx: &mut S,
        entry: LogEntry,
        compacted: &CompactedBlocks,
    ) -> Result<(), ApplyError> {
        for id in &compacted.source_blocks {
            tx.delete_block(&compacted.tenant, compacted.shard, id)?;
        }
        // Outputs that collide with a live block other than a source are
        // dropped, so the store and the index keep the same metadata.
        let mut new_blocks: Vec<&BlockMeta> = {
            let index = self.index();
            compacted
                .new_blocks
                .iter()
                .filter(|b| {
                    let replaced = b.tenant == compacted.tenant
                        && b.shard == compacted.shard
                        && compacted.source_blocks.contains(&b.id);
                    replaced || !index.contains(&b.tenant, b.shard, &b.id)
                })
                .collect()
        };
        new_blocks.sort_by(|a, b| a.id.cmp(&b.id));
        new_blocks.dedup_by(|a, b| a.tenant == b.tenant && a.shard == b.shard && a.id == b.id);
        for block in &new_blocks {
            tx.store_block(block)?;
        }
        for block in new_blocks {
            self.compactor
                .add_block(tx, entry.index, entry.appended_at, block)?;
        }
        self.index_mut().replace(compacted);
        Ok(())
    }

    fn summarize(&self, applied: &AppliedSchedule) -> PlanApplied {
        let index = self.index();
        PlanApplied {
            assigned_jobs: applied
                .assigned_jobs
                .iter()
                .map(|job| compaction_job(&index, job))
                .collect(),
            new_jobs: applied.new_jobs.len(),
            updated_jobs: applied.updated_jobs.len(),
            completed_jobs: applied.completed_jobs.len(),
            evicted_jobs: applied.evicted_jobs.len(),
        }
    }
}

/// Resolves an assignment into the job a worker runs.
fn compaction_job(index: &BlockIndex, job: &AssignedCompactionJob) -> CompactionJob {
    let plan = &job.plan;
    CompactionJob {
        name: plan.name.clone(),
        tenant: plan.tenant.clone(),
        shard: plan.shard,
        compaction_level: plan.compaction_level,
        source_blocks: index.find(&plan.tenant, plan.shard, &plan.source_blocks),
        tombstones: plan.tombstones.clone(),
        token: job.state.token,
        lease_expires_at: job.state.lease_expires_at,
    }
}
