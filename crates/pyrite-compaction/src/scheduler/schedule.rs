//! Side-effect-free scheduling proposals.
//!
//! A [`Schedule`] is bound to one log entry: its index is the fencing token
//! handed to every job it assigns, and its append time is "now". It works on
//! copy-on-write clones of the level heaps and records every decision in a
//! [`CompactionPlanUpdate`]. Nothing it does is visible until the update is
//! committed and applied by [`super::Scheduler::update_schedule`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::MutexGuard;

use pyrite_types::{
    AssignedCompactionJob, CompactedBlocks, CompactionJobPlan, CompactionJobState,
    CompactionJobStatus, CompactionJobStatusUpdate, CompactionPlanUpdate, CompletedCompactionJob,
    EvictedCompactionJob, LogIndex, NewCompactionJob, Timestamp, UpdatedCompactionJob,
};

use super::queue::{JobQueue, LevelQueue};
use crate::config::SchedulerConfig;
use crate::error::CompactionError;
use crate::store::JobStore;

/// A scheduling proposal over a locked view of the job queue.
pub struct Schedule<'a> {
    queue: MutexGuard<'a, JobQueue>,
    store: &'a dyn JobStore,
    config: SchedulerConfig,
    token: LogIndex,
    now: Timestamp,
    /// Copy-on-write views, cloned from the queue on first use.
    levels: BTreeMap<u32, LevelQueue>,
    /// Plans of jobs added by this proposal; they are not in the store yet.
    added: HashMap<String, CompactionJobPlan>,
    /// Jobs this proposal already changed.
    touched: HashSet<String>,
    update: CompactionPlanUpdate,
}

impl std::fmt::Debug for Schedule<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("token", &self.token)
            .field("now", &self.now)
            .field("update", &self.update)
            .finish_non_exhaustive()
    }
}

impl<'a> Schedule<'a> {
    pub(crate) fn new(
        queue: MutexGuard<'a, JobQueue>,
        store: &'a dyn JobStore,
        config: SchedulerConfig,
        token: LogIndex,
        now: Timestamp,
    ) -> Self {
        Self {
            queue,
            store,
            config,
            token,
            now,
            levels: BTreeMap::new(),
            added: HashMap::new(),
            touched: HashSet::new(),
            update: CompactionPlanUpdate::default(),
        }
    }

    pub fn token(&self) -> LogIndex {
        self.token
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Applies a worker's status report to the proposal.
    ///
    /// Returns the proposed job state, or `None` if the report is dropped:
    /// the job is unknown or not running, the token is not the last one
    /// issued, or the status carries no transition.
    pub fn update_job(
        &mut self,
        update: &CompactionJobStatusUpdate,
    ) -> Result<Option<CompactionJobState>, CompactionError> {
        if self.touched.contains(&update.name) {
            return Ok(None);
        }
        let Some(current) = self.queue.get(&update.name) else {
            tracing::debug!(job = %update.name, "status update for unknown job");
            return Ok(None);
        };
        if update.token != current.token {
            tracing::debug!(
                job = %update.name,
                token = %update.token,
                current = %current.token,
                "status update from stale owner"
            );
            return Ok(None);
        }
        if current.status != CompactionJobStatus::InProgress {
            return Ok(None);
        }

        let mut state = current.clone();
        match update.status {
            CompactionJobStatus::InProgress => {
                state.lease_expires_at = self.lease_deadline();
                self.level_view(state.compaction_level).push(state.clone());
                self.update.updated_jobs.push(UpdatedCompactionJob {
                    state: state.clone(),
                });
            }
            CompactionJobStatus::Success => {
                let Some(plan) = self.plan(&state.name)? else {
                    tracing::warn!(job = %state.name, "completed job has no plan");
                    return Ok(None);
                };
                let compacted = CompactedBlocks {
                    tenant: plan.tenant,
                    shard: plan.shard,
                    source_blocks: plan.source_blocks,
                    new_blocks: update
                        .compacted
                        .as_ref()
                        .map(|c| c.new_blocks.clone())
                        .unwrap_or_default(),
                };
                state.status = CompactionJobStatus::Success;
                self.level_view(state.compaction_level).remove(&state.name);
                self.update.completed_jobs.push(CompletedCompactionJob {
                    state: state.clone(),
                    compacted,
                });
            }
            _ => return Ok(None),
        }
        self.touched.insert(state.name.clone());
        Ok(Some(state))
    }

    /// Proposes a new job for a freshly planned batch of blocks.
    ///
    /// Returns `None` if a job of the same name exists or the queue is full.
    pub fn add_job(&mut self, plan: CompactionJobPlan) -> Option<CompactionJobState> {
        if self.queue.contains(&plan.name) || self.added.contains_key(&plan.name) {
            return None;
        }
        let max = self.config.max_queue_size;
        if max > 0 && self.queue.len() + self.added.len() >= max {
            tracing::debug!(job = %plan.name, max, "job queue is full");
            return None;
        }

        let state = CompactionJobState {
            name: plan.name.clone(),
            compaction_level: plan.compaction_level,
            status: CompactionJobStatus::Unspecified,
            token: LogIndex::ZERO,
            lease_expires_at: Timestamp::EPOCH,
            failures: 0,
            added_at: self.now,
        };
        self.level_view(state.compaction_level).push(state.clone());
        self.added.insert(plan.name.clone(), plan.clone());
        self.update.new_jobs.push(NewCompactionJob {
            state: state.clone(),
            plan,
        });
        Some(state)
    }

    /// Assigns the next eligible job, lowest level first.
    ///
    /// A job that has exhausted its failure budget is evicted instead of
    /// reassigned, and the scan continues.
    pub fn assign_job(
        &mut self,
    ) -> Result<Option<(CompactionJobPlan, CompactionJobState)>, CompactionError> {
        let levels = self
            .queue
            .levels()
            .len()
            .max(self.levels.last_key_value().map_or(0, |(l, _)| *l as usize + 1));

        for level in 0..levels as u32 {
            while let Some(mut state) = self.level_view(level).pop() {
                if self.touched.contains(&state.name) {
                    continue;
                }
                match state.status {
                    CompactionJobStatus::Unspecified => {}
                    CompactionJobStatus::InProgress if state.lease_expired(self.now) => {
                        if self.exhausted(&state) {
                            self.evict(state);
                            continue;
                        }
                        state.failures += 1;
                    }
                    _ => continue,
                }

                let Some(plan) = self.plan(&state.name)? else {
                    tracing::warn!(job = %state.name, "job plan not found, skipping");
                    continue;
                };
                state.status = CompactionJobStatus::InProgress;
                state.token = self.token;
                state.lease_expires_at = self.lease_deadline();
                self.touched.insert(state.name.clone());
                self.update.assigned_jobs.push(AssignedCompactionJob {
                    state: state.clone(),
                    plan: plan.clone(),
                });
                return Ok(Some((plan, state)));
            }
        }
        Ok(None)
    }

    /// The accumulated proposal.
    pub fn into_update(self) -> CompactionPlanUpdate {
        self.update
    }

    fn exhausted(&self, state: &CompactionJobState) -> bool {
        self.config.max_failures > 0 && state.failures >= self.config.max_failures
    }

    fn evict(&mut self, mut state: CompactionJobState) {
        tracing::debug!(
            job = %state.name,
            failures = state.failures,
            "proposing eviction of failing job"
        );
        state.status = CompactionJobStatus::Cancelled;
        self.touched.insert(state.name.clone());
        self.update.evicted_jobs.push(EvictedCompactionJob { state });
    }

    fn lease_deadline(&self) -> Timestamp {
        self.now.saturating_add(self.config.lease_duration())
    }

    fn level_view(&mut self, level: u32) -> &mut LevelQueue {
        let queue = &self.queue;
        self.levels
            .entry(level)
            .or_insert_with(|| queue.level(level).cloned().unwrap_or_default())
    }

    fn plan(&self, name: &str) -> Result<Option<CompactionJobPlan>, CompactionError> {
        if let Some(plan) = self.added.get(name) {
            return Ok(Some(plan.clone()));
        }
        Ok(self.store.get_job_plan(name)?)
    }
}
