//! Per-level job priority queues.
//!
//! Each level is an indexed binary min-heap: the heap vector holds job
//! states, and a name-to-slot map lets a job be updated or removed in
//! O(log n) without scanning.

use std::cmp::Ordering;
use std::collections::HashMap;

use pyrite_types::{CompactionJobState, CompactionJobStatus};

/// Scheduling priority: unassigned jobs first, then in-progress jobs with
/// fewer failures, then the lease that expires first. The name breaks ties
/// so the order is total.
pub(crate) fn compare_jobs(a: &CompactionJobState, b: &CompactionJobState) -> Ordering {
    a.status
        .rank()
        .cmp(&b.status.rank())
        .then(a.failures.cmp(&b.failures))
        .then(a.lease_expires_at.cmp(&b.lease_expires_at))
        .then_with(|| a.name.cmp(&b.name))
}

/// Jobs of one compaction level, ordered by [`compare_jobs`].
#[derive(Debug, Clone, Default)]
pub struct LevelQueue {
    heap: Vec<CompactionJobState>,
    positions: HashMap<String, usize>,
}

impl LevelQueue {
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The highest-priority job.
    pub fn peek(&self) -> Option<&CompactionJobState> {
        self.heap.first()
    }

    pub fn get(&self, name: &str) -> Option<&CompactionJobState> {
        self.positions.get(name).map(|&i| &self.heap[i])
    }

    /// Jobs in heap order, which is not priority order.
    pub fn iter(&self) -> impl Iterator<Item = &CompactionJobState> {
        self.heap.iter()
    }

    /// Inserts a job, or replaces the job of the same name and restores
    /// heap order around it.
    pub(crate) fn push(&mut self, state: CompactionJobState) {
        if let Some(&i) = self.positions.get(&state.name) {
            self.heap[i] = state;
            self.fix(i);
            return;
        }
        let i = self.heap.len();
        self.positions.insert(state.name.clone(), i);
        self.heap.push(state);
        self.sift_up(i);
    }

    pub(crate) fn pop(&mut self) -> Option<CompactionJobState> {
        self.remove_at(0)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<CompactionJobState> {
        let i = *self.positions.get(name)?;
        self.remove_at(i)
    }

    fn remove_at(&mut self, i: usize) -> Option<CompactionJobState> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(i, last);
        let removed = self.heap.pop()?;
        self.positions.remove(&removed.name);
        if i < self.heap.len() {
            self.fix(i);
        }
        Some(removed)
    }

    fn fix(&mut self, i: usize) {
        if !self.sift_up(i) {
            self.sift_down(i);
        }
    }

    /// Returns true if the element moved.
    fn sift_up(&mut self, mut i: usize) -> bool {
        let start = i;
        while i > 0 {
            let parent = (i - 1) / 2;
            if compare_jobs(&self.heap[i], &self.heap[parent]) != Ordering::Less {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
        i != start
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < len && compare_jobs(&self.heap[right], &self.heap[left]) == Ordering::Less {
                child = right;
            }
            if compare_jobs(&self.heap[child], &self.heap[i]) != Ordering::Less {
                break;
            }
            self.swap(i, child);
            i = child;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].name.clone(), a);
        self.positions.insert(self.heap[b].name.clone(), b);
    }
}

/// All queued jobs, one [`LevelQueue`] per compaction level.
#[derive(Debug, Default)]
pub struct JobQueue {
    levels: Vec<LevelQueue>,
    names: HashMap<String, u32>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&CompactionJobState> {
        let level = *self.names.get(name)?;
        self.level(level)?.get(name)
    }

    pub fn level(&self, level: u32) -> Option<&LevelQueue> {
        self.levels.get(level as usize)
    }

    pub fn levels(&self) -> &[LevelQueue] {
        &self.levels
    }

    /// Inserts or replaces a job.
    pub(crate) fn put(&mut self, state: CompactionJobState) {
        let level = state.compaction_level;
        if let Some(previous) = self.names.get(&state.name).copied() {
            if previous != level {
                self.levels[previous as usize].remove(&state.name);
            }
        }
        while self.levels.len() <= level as usize {
            self.levels.push(LevelQueue::default());
        }
        self.names.insert(state.name.clone(), level);
        self.levels[level as usize].push(state);
    }

    pub(crate) fn delete(&mut self, name: &str) -> Option<CompactionJobState> {
        let level = self.names.remove(name)?;
        self.levels.get_mut(level as usize)?.remove(name)
    }

    pub(crate) fn clear(&mut self) {
        self.levels.clear();
        self.names.clear();
    }

    /// All jobs ordered by name.
    pub fn jobs(&self) -> Vec<&CompactionJobState> {
        let mut jobs: Vec<_> = self.levels.iter().flat_map(LevelQueue::iter).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn stats(&self) -> SchedulerStats {
        let levels = self
            .levels
            .iter()
            .enumerate()
            .map(|(level, queue)| {
                let mut stats = LevelJobStats {
                    level: level as u32,
                    ..LevelJobStats::default()
                };
                for job in queue.iter() {
                    match job.status {
                        CompactionJobStatus::Unspecified => stats.unassigned += 1,
                        CompactionJobStatus::InProgress => stats.in_progress += 1,
                        _ => stats.other += 1,
                    }
                }
                stats
            })
            .collect();
        SchedulerStats { levels }
    }
}

/// Job counts of one level by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelJobStats {
    pub level: u32,
    pub unassigned: usize,
    pub in_progress: usize,
    pub other: usize,
}

/// Job counts of the whole scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub levels: Vec<LevelJobStats>,
}

impl SchedulerStats {
    pub fn jobs(&self) -> usize {
        self.levels
            .iter()
            .map(|l| l.unassigned + l.in_progress + l.other)
            .sum()
    }
}
