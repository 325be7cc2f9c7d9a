//! Single-process replicated log.
//!
//! Every proposal is encoded, appended and applied to each replica in
//! order, the way a consensus layer would deliver committed entries. Time
//! only moves when the caller advances the clock, so runs are
//! reproducible.
//!
//! A replica applies each entry to a copy of its store and keeps the copy
//! only if the entry applied cleanly. A replica whose apply fails stops
//! applying until [`LocalLog::restart_replica`] restores it from its store
//! and replays the missing entries.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pyrite_compaction::{CompactorConfig, SchedulerConfig};
use pyrite_types::{LogIndex, Timestamp};

use crate::command::{Command, LogEntry, Response};
use crate::error::{ApplyError, ServiceError};
use crate::metastore::Metastore;
use crate::service::Raft;
use crate::store::{MemoryStore, MetastoreStore};

#[derive(Debug)]
struct Replica<S> {
    metastore: Metastore,
    store: S,
    applied: LogIndex,
    behind: bool,
}

impl<S: MetastoreStore + Clone> Replica<S> {
    fn apply(&mut self, entry: LogEntry, command: &Command) -> Result<Response, ApplyError> {
        let mut tx = self.store.clone();
        let response = self.metastore.apply(&mut tx, entry, command)?;
        self.store = tx;
        self.applied = entry.index;
        Ok(response)
    }
}

#[derive(Debug)]
struct LogState<S> {
    entries: Vec<(LogEntry, Vec<u8>)>,
    clock: Timestamp,
    leader: bool,
    replicas: Vec<Replica<S>>,
}

#[derive(Debug)]
pub struct LocalLog<S = MemoryStore> {
    compactor: CompactorConfig,
    scheduler: SchedulerConfig,
    state: Mutex<LogState<S>>,
}

impl<S: MetastoreStore + Clone + Default> LocalLog<S> {
    pub fn new(replicas: usize, compactor: CompactorConfig, scheduler: SchedulerConfig) -> Self {
        let replicas = (0..replicas)
            .map(|_| Replica {
                metastore: Metastore::new(compactor.clone(), scheduler),
                store: S::default(),
                applied: LogIndex::ZERO,
                behind: false,
            })
            .collect();
        Self {
            compactor,
            scheduler,
            state: Mutex::new(LogState {
                entries: Vec::new(),
                clock: Timestamp::EPOCH,
                leader: true,
                replicas,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> Timestamp {
        self.lock().clock
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.clock = state.clock.saturating_add(duration);
    }

    /// Makes proposals fail with [`ServiceError::NotLeader`] while false.
    pub fn set_leader(&self, leader: bool) {
        self.lock().leader = leader;
    }

    pub fn last_index(&self) -> LogIndex {
        self.lock()
            .entries
            .last()
            .map_or(LogIndex::ZERO, |(entry, _)| entry.index)
    }

    pub fn replica_count(&self) -> usize {
        self.lock().replicas.len()
    }

    pub fn is_behind(&self, replica: usize) -> bool {
        self.lock().replicas.get(replica).is_some_and(|r| r.behind)
    }

    pub fn applied_index(&self, replica: usize) -> Option<LogIndex> {
        self.lock().replicas.get(replica).map(|r| r.applied)
    }

    /// Runs `f` against a replica's state machine.
    pub fn with_replica<R>(&self, replica: usize, f: impl FnOnce(&Metastore) -> R) -> Option<R> {
        self.lock().replicas.get(replica).map(|r| f(&r.metastore))
    }

    /// Runs `f` against a replica's committed store.
    pub fn with_store<R>(&self, replica: usize, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.lock().replicas.get_mut(replica).map(|r| f(&mut r.store))
    }

    pub fn state_hashes(&self) -> Vec<[u8; 32]> {
        self.lock()
            .replicas
            .iter()
            .map(|r| r.metastore.compute_state_hash())
            .collect()
    }

    /// Replaces a replica's state machine with one restored from its store,
    /// then applies the entries it missed.
    pub fn restart_replica(&self, replica: usize) -> Result<(), ServiceError> {
        let mut state = self.lock();
        let LogState {
            entries, replicas, ..
        } = &mut *state;
        let Some(r) = replicas.get_mut(replica) else {
            return Err(ServiceError::Unavailable);
        };

        let metastore = Metastore::new(self.compactor.clone(), self.scheduler);
        metastore.restore(&r.store)?;
        r.metastore = metastore;
        r.behind = false;

        let start = usize::try_from(r.applied.as_u64()).unwrap_or(usize::MAX);
        for (entry, bytes) in entries.iter().skip(start) {
            let command: Command = postcard::from_bytes(bytes)?;
            if let Err(err) = r.apply(*entry, &command) {
                tracing::warn!(replica, index = %entry.index, error = %err, "catch-up failed");
                r.behind = true;
                return Err(err.into());
            }
        }
        tracing::info!(replica, applied = %r.applied, "replica restarted");
        Ok(())
    }
}

impl<S: MetastoreStore + Clone + Default> Raft for LocalLog<S> {
    /// Appends the command and applies it everywhere. Returns the first
    /// replica's response.
    fn propose(&self, command: Command) -> Result<Response, ServiceError> {
        let mut state = self.lock();
        if !state.leader {
            return Err(ServiceError::NotLeader);
        }

        let index = LogIndex::new(state.entries.len() as u64 + 1);
        let entry = LogEntry::new(index, state.clock);
        let bytes = postcard::to_allocvec(&command)?;
        // Replicas apply what was committed, not what was proposed.
        let committed: Command = postcard::from_bytes(&bytes)?;
        state.entries.push((entry, bytes));

        let mut first = None;
        for (i, replica) in state.replicas.iter_mut().enumerate() {
            if replica.behind {
                continue;
            }
            let result = replica.apply(entry, &committed);
            if let Err(err) = &result {
                tracing::warn!(replica = i, index = %index, error = %err, "apply failed, replica is behind");
                replica.behind = true;
            }
            if i == 0 {
                first = Some(result);
            }
        }

        match first {
            Some(result) => Ok(result?),
            None => Err(ServiceError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrite_types::BlockMeta;

    fn log(replicas: usize) -> LocalLog {
        LocalLog::new(replicas, CompactorConfig::default(), SchedulerConfig::default())
    }

    #[test]
    fn entries_reach_every_replica() {
        let log = log(3);
        log.propose(Command::add_block(BlockMeta::new("a", "t", 1, 0)))
            .expect("propose");
        assert_eq!(log.last_index(), LogIndex::new(1));
        for replica in 0..3 {
            assert_eq!(log.applied_index(replica), Some(LogIndex::new(1)));
        }
        let hashes = log.state_hashes();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn clock_stamps_entries() {
        let log = log(1);
        log.advance(Duration::from_secs(2));
        assert_eq!(log.now(), Timestamp::from_millis(2_000));
    }

    #[test]
    fn follower_is_rejected() {
        let log = log(1);
        log.set_leader(false);
        let result = log.propose(Command::add_block(BlockMeta::new("a", "t", 1, 0)));
        assert!(matches!(result, Err(ServiceError::NotLeader)));
        assert_eq!(log.last_index(), LogIndex::ZERO);
    }

    #[test]
    fn failed_replica_catches_up_after_restart() {
        let log = log(2);
        log.with_store(1, |store| store.set_fail_writes(true));
        log.propose(Command::add_block(BlockMeta::new("a", "t", 1, 0)))
            .expect("propose");
        assert!(log.is_behind(1));
        log.propose(Command::add_block(BlockMeta::new("b", "t", 1, 0)))
            .expect("propose");
        assert_eq!(log.applied_index(1), Some(LogIndex::ZERO));

        log.with_store(1, |store| store.set_fail_writes(false));
        log.restart_replica(1).expect("restart");
        assert!(!log.is_behind(1));
        assert_eq!(log.applied_index(1), Some(LogIndex::new(2)));
        let hashes = log.state_hashes();
        assert_eq!(hashes[0], hashes[1]);
    }
}
