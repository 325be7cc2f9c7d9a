//! Worker-facing compaction service.
//!
//! A poll is two proposals. The first, `GetCompactionPlanUpdate`, commits
//! nothing: its log index becomes the fencing token and its append time the
//! lease clock. The update it computes is then proposed as
//! `UpdateCompactionPlan`, and only what survives that apply is returned.

use std::sync::Arc;

use pyrite_types::{BlockMeta, CompactionJob, CompactionJobStatusUpdate};
use serde::{Deserialize, Serialize};

use crate::command::{Command, PlanApplied, Response};
use crate::error::ServiceError;

/// Consensus layer as seen by the service.
///
/// `propose` returns once the command is committed and applied locally.
pub trait Raft {
    fn propose(&self, command: Command) -> Result<Response, ServiceError>;
}

impl<T: Raft + ?Sized> Raft for &T {
    fn propose(&self, command: Command) -> Result<Response, ServiceError> {
        (**self).propose(command)
    }
}

impl<T: Raft + ?Sized> Raft for Arc<T> {
    fn propose(&self, command: Command) -> Result<Response, ServiceError> {
        (**self).propose(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Upper bound on jobs planned per poll. Zero means unbounded.
    pub max_new_jobs_per_poll: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_new_jobs_per_poll: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCompactionJobsRequest {
    /// Progress of the jobs the worker currently owns.
    pub status_updates: Vec<CompactionJobStatusUpdate>,
    /// Number of new jobs the worker can take.
    pub job_capacity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCompactionJobsResponse {
    pub compaction_jobs: Vec<CompactionJob>,
}

#[derive(Debug)]
pub struct CompactionService<R> {
    config: ServiceConfig,
    raft: R,
}

impl<R: Raft> CompactionService<R> {
    pub fn new(config: ServiceConfig, raft: R) -> Self {
        Self { config, raft }
    }

    pub fn raft(&self) -> &R {
        &self.raft
    }

    /// Registers a new block. Returns false if it was already known.
    pub fn add_block(&self, block: BlockMeta) -> Result<bool, ServiceError> {
        let command = Command::add_block(block);
        match self.raft.propose(command)? {
            Response::BlockAdded { accepted } => Ok(accepted),
            _ => Err(ServiceError::UnexpectedResponse("AddBlock")),
        }
    }

    /// Reports job progress and receives new assignments.
    pub fn poll_compaction_jobs(
        &self,
        request: PollCompactionJobsRequest,
    ) -> Result<PollCompactionJobsResponse, ServiceError> {
        let command = Command::GetCompactionPlanUpdate {
            status_updates: request.status_updates,
            assign_jobs_max: request.job_capacity,
            new_jobs_max: self.config.max_new_jobs_per_poll,
        };
        let plan_update = match self.raft.propose(command)? {
            Response::PlanUpdate(update) => update,
            _ => return Err(ServiceError::UnexpectedResponse("GetCompactionPlanUpdate")),
        };
        if plan_update.is_empty() {
            tracing::trace!("nothing to update");
            return Ok(PollCompactionJobsResponse::default());
        }

        let command = Command::UpdateCompactionPlan { plan_update };
        let applied: PlanApplied = match self.raft.propose(command)? {
            Response::PlanApplied(applied) => applied,
            _ => return Err(ServiceError::UnexpectedResponse("UpdateCompactionPlan")),
        };
        tracing::debug!(
            new = applied.new_jobs,
            assigned = applied.assigned_jobs.len(),
            updated = applied.updated_jobs,
            completed = applied.completed_jobs,
            evicted = applied.evicted_jobs,
            "compaction plan updated"
        );
        Ok(PollCompactionJobsResponse {
            compaction_jobs: applied.assigned_jobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned responses and records proposals.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<Vec<Response>>,
        proposed: Mutex<Vec<&'static str>>,
    }

    impl Raft for Scripted {
        fn propose(&self, command: Command) -> Result<Response, ServiceError> {
            self.proposed.lock().expect("lock").push(command.name());
            self.responses
                .lock()
                .expect("lock")
                .pop()
                .ok_or(ServiceError::Unavailable)
        }
    }

    #[test]
    fn empty_update_is_not_proposed() {
        let raft = Scripted::default();
        raft.responses
            .lock()
            .expect("lock")
            .push(Response::PlanUpdate(Default::default()));
        let service = CompactionService::new(ServiceConfig::default(), &raft);

        let response = service
            .poll_compaction_jobs(PollCompactionJobsRequest::default())
            .expect("poll");
        assert!(response.compaction_jobs.is_empty());
        assert_eq!(*raft.proposed.lock().expect("lock"), ["GetCompactionPlanUpdate"]);
    }

    #[test]
    fn mismatched_response_is_an_error() {
        let raft = Scripted::default();
        raft.responses
            .lock()
            .expect("lock")
            .push(Response::BlockAdded { accepted: true });
        let service = CompactionService::new(ServiceConfig::default(), &raft);

        let result = service.poll_compaction_jobs(PollCompactionJobsRequest::default());
        assert!(matches!(
            result,
            Err(ServiceError::UnexpectedResponse("GetCompactionPlanUpdate"))
        ));
    }
}
