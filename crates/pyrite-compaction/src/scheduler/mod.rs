//! Lease-based job scheduling.
//!
//! The scheduler owns the state of every queued job. Proposals are computed
//! by a [`Schedule`]; only [`Scheduler::update_schedule`], called from the
//! log apply path, changes the queue and the job store.

mod queue;
mod schedule;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pyrite_types::{
    AssignedCompactionJob, CompactedBlocks, CompactionJobPlan, CompactionJobState,
    CompactionJobStatus, CompactionPlanUpdate, LogIndex, Timestamp,
};

pub use queue::{JobQueue, LevelJobStats, LevelQueue, SchedulerStats};
pub use schedule::Schedule;

use crate::config::SchedulerConfig;
use crate::error::CompactionError;
use crate::metrics::CompactionMetrics;
use crate::store::JobStore;

/// Entries of a [`CompactionPlanUpdate`] that survived revalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedSchedule {
    pub new_jobs: Vec<CompactionJobPlan>,
    pub assigned_jobs: Vec<AssignedCompactionJob>,
    pub updated_jobs: Vec<CompactionJobState>,
    /// Completed jobs with their plans, whose blocks must now be replaced.
    pub completed_jobs: Vec<(CompactionJobPlan, CompactedBlocks)>,
    /// Plans of cancelled jobs.
    pub evicted_jobs: Vec<CompactionJobPlan>,
}

/// Owner of job states.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Mutex<JobQueue>,
    metrics: Arc<CompactionMetrics>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, metrics: Arc<CompactionMetrics>) -> Self {
        Self {
            config,
            queue: Mutex::new(JobQueue::new()),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a proposal for the log entry at `token`, appended at `now`.
    ///
    /// The schedule holds the queue lock until dropped.
    pub fn new_schedule<'a>(
        &'a self,
        store: &'a dyn JobStore,
        token: LogIndex,
        now: Timestamp,
    ) -> Schedule<'a> {
        Schedule::new(self.lock(), store, self.config, token, now)
    }

    /// Applies a committed proposal.
    ///
    /// Every entry is revalidated against the current state, since other
    /// updates may have been applied after the proposal was made. Entries
    /// that no longer hold are skipped; only store failures are errors.
    pub fn update_schedule<S: JobStore + ?Sized>(
        &self,
        tx: &mut S,
        update: &CompactionPlanUpdate,
    ) -> Result<AppliedSchedule, CompactionError> {
        let mut queue = self.lock();
        let mut applied = AppliedSchedule::default();

        for job in &update.new_jobs {
            if queue.contains(&job.state.name) {
                tracing::warn!(job = %job.state.name, "job already exists, skipping");
                continue;
            }
            tx.store_job_plan(&job.plan)?;
            tx.store_job_state(&job.state)?;
            queue.put(job.state.clone());
            self.metrics.record_job_added(job.state.compaction_level);
            tracing::debug!(
                job = %job.state.name,
                level = job.state.compaction_level,
                blocks = job.plan.source_blocks.len(),
                "job added"
            );
            applied.new_jobs.push(job.plan.clone());
        }

        for job in &update.assigned_jobs {
            let state = &job.state;
            let Some(current) = queue.get(&state.name) else {
                tracing::warn!(job = %state.name, "assigned job not found");
                continue;
            };
            if current.status.is_terminal() || current.token >= state.token {
                tracing::warn!(
                    job = %state.name,
                    token = %state.token,
                    current = %current.token,
                    "stale assignment, skipping"
                );
                continue;
            }
            let reassigned = current.status == CompactionJobStatus::InProgress;
            tx.store_job_state(state)?;
            queue.put(state.clone());
            if reassigned {
                self.metrics.record_job_reassigned(state.compaction_level);
            } else {
                self.metrics.record_job_assigned(state.compaction_level);
            }
            tracing::debug!(
                job = %state.name,
                token = %state.token,
                failures = state.failures,
                reassigned,
                "job assigned"
            );
            applied.assigned_jobs.push(job.clone());
        }

        for job in &update.updated_jobs {
            let state = &job.state;
            if !owned_by(&queue, state) {
                tracing::warn!(job = %state.name, token = %state.token, "stale lease renewal");
                continue;
            }
            tx.store_job_state(state)?;
            queue.put(state.clone());
            applied.updated_jobs.push(state.clone());
        }

        for job in &update.completed_jobs {
            let state = &job.state;
            if !owned_by(&queue, state) {
                tracing::warn!(job = %state.name, token = %state.token, "stale completion");
                continue;
            }
            let plan = tx.get_job_plan(&state.name)?;
            tx.delete_job_state(&state.name)?;
            tx.delete_job_plan(&state.name)?;
            queue.delete(&state.name);
            self.metrics.record_job_completed(state.compaction_level);
            tracing::info!(
                job = %state.name,
                level = state.compaction_level,
                new_blocks = job.compacted.new_blocks.len(),
                "job completed"
            );
            match plan {
                Some(plan) => applied.completed_jobs.push((plan, job.compacted.clone())),
                None => tracing::warn!(job = %state.name, "completed job has no stored plan"),
            }
        }

        for job in &update.evicted_jobs {
            let state = &job.state;
            let Some(current) = queue.get(&state.name) else {
                continue;
            };
            // A renewal applied after the proposal keeps the token but moves
            // the lease.
            if current.token != state.token || current.lease_expires_at != state.lease_expires_at {
                tracing::warn!(job = %state.name, "stale eviction");
                continue;
            }
            let plan = tx.get_job_plan(&state.name)?;
            tx.delete_job_state(&state.name)?;
            tx.delete_job_plan(&state.name)?;
            queue.delete(&state.name);
            self.metrics.record_job_evicted(state.compaction_level);
            tracing::warn!(
                job = %state.name,
                failures = state.failures,
                "job cancelled after repeated failures"
            );
            if let Some(plan) = plan {
                applied.evicted_jobs.push(plan);
            }
        }

        Ok(applied)
    }

    /// Rebuilds the queue from the job store.
    pub fn restore<S: JobStore + ?Sized>(&self, tx: &S) -> Result<(), CompactionError> {
        let states = tx.list_job_states()?;
        let mut queue = self.lock();
        queue.clear();
        let count = states.len();
        for state in states {
            queue.put(state);
        }
        tracing::info!(jobs = count, "job queue restored");
        Ok(())
    }

    pub fn job(&self, name: &str) -> Option<CompactionJobState> {
        self.lock().get(name).cloned()
    }

    /// All job states ordered by name.
    pub fn jobs(&self) -> Vec<CompactionJobState> {
        self.lock().jobs().into_iter().cloned().collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.lock().stats()
    }
}

/// True if `state` carries the current token of a running job.
fn owned_by(queue: &JobQueue, state: &CompactionJobState) -> bool {
    queue.get(&state.name).is_some_and(|current| {
        current.status == CompactionJobStatus::InProgress && current.token == state.token
    })
}
