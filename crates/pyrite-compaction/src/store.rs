//! Durable stores consumed by the compaction core.
//!
//! Every write happens inside the storage transaction of the log entry being
//! applied, so "entry applied" and "derived state persisted" commit together.
//! A `&mut` store handle stands for that transaction; read-only proposal code
//! receives a shared reference.
//!
//! [`InMemoryStore`] keeps postcard-encoded records in ordered buckets. It is
//! used by tests and simulations, and restores go through the same encoding
//! a disk-backed store would use.

use std::collections::BTreeMap;

use pyrite_types::{BlockEntry, BlockId, CompactionJobPlan, CompactionJobState, LogIndex};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::StoreError;
use crate::tombstones::TombstoneEntry;

/// Persistence of staged block entries.
pub trait QueueStore {
    fn store_entry(&mut self, entry: &BlockEntry) -> Result<(), StoreError>;

    fn delete_entry(&mut self, index: LogIndex, id: &BlockId) -> Result<(), StoreError>;

    /// Returns all entries in log-index order.
    fn list_entries(&self) -> Result<Vec<BlockEntry>, StoreError>;
}

/// Persistence of job plans and job states.
pub trait JobStore {
    fn store_job_plan(&mut self, plan: &CompactionJobPlan) -> Result<(), StoreError>;

    fn get_job_plan(&self, name: &str) -> Result<Option<CompactionJobPlan>, StoreError>;

    fn delete_job_plan(&mut self, name: &str) -> Result<(), StoreError>;

    fn store_job_state(&mut self, state: &CompactionJobState) -> Result<(), StoreError>;

    fn delete_job_state(&mut self, name: &str) -> Result<(), StoreError>;

    /// Returns all job states ordered by name.
    fn list_job_states(&self) -> Result<Vec<CompactionJobState>, StoreError>;
}

/// Persistence of tombstones awaiting physical cleanup.
pub trait TombstoneStore {
    fn store_tombstones(&mut self, entry: &TombstoneEntry) -> Result<(), StoreError>;

    fn delete_tombstones(&mut self, name: &str) -> Result<(), StoreError>;

    /// Returns all tombstone entries in log-index order.
    fn list_tombstones(&self) -> Result<Vec<TombstoneEntry>, StoreError>;
}

/// Everything the metastore apply path persists.
pub trait CompactionStore: QueueStore + JobStore + TombstoneStore {}

impl<T: QueueStore + JobStore + TombstoneStore + ?Sized> CompactionStore for T {}

// ============================================================================
// In-memory implementation
// ============================================================================

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered key/value buckets holding encoded records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    queue: Bucket,
    job_plans: Bucket,
    job_states: Bucket,
    tombstones: Bucket,
    fail_writes: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn entry_count(&self) -> usize {
        self.queue.len()
    }

    pub fn job_count(&self) -> usize {
        self.job_states.len()
    }

    pub fn plan_count(&self) -> usize {
        self.job_plans.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

fn entry_key(index: LogIndex, id: &BlockId) -> Vec<u8> {
    let mut key = index.as_u64().to_be_bytes().to_vec();
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, StoreError> {
    postcard::to_allocvec(value).map_err(|source| StoreError::Encode { what, source })
}

fn decode<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|source| StoreError::Decode { what, source })
}

fn decode_all<T: DeserializeOwned>(what: &'static str, bucket: &Bucket) -> Result<Vec<T>, StoreError> {
    bucket.values().map(|bytes| decode(what, bytes)).collect()
}

impl QueueStore for InMemoryStore {
    fn store_entry(&mut self, entry: &BlockEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        let value = encode("block entry", entry)?;
        self.queue.insert(entry_key(entry.index, &entry.id), value);
        Ok(())
    }

    fn delete_entry(&mut self, index: LogIndex, id: &BlockId) -> Result<(), StoreError> {
        self.check_writable()?;
        self.queue.remove(&entry_key(index, id));
        Ok(())
    }

    fn list_entries(&self) -> Result<Vec<BlockEntry>, StoreError> {
        decode_all("block entry", &self.queue)
    }
}

impl JobStore for InMemoryStore {
    fn store_job_plan(&mut self, plan: &CompactionJobPlan) -> Result<(), StoreError> {
        self.check_writable()?;
        let value = encode("job plan", plan)?;
        self.job_plans.insert(plan.name.as_bytes().to_vec(), value);
        Ok(())
    }

    fn get_job_plan(&self, name: &str) -> Result<Option<CompactionJobPlan>, StoreError> {
        self.job_plans
            .get(name.as_bytes())
            .map(|bytes| decode("job plan", bytes))
            .transpose()
    }

    fn delete_job_plan(&mut self, name: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.job_plans.remove(name.as_bytes());
        Ok(())
    }

    fn store_job_state(&mut self, state: &CompactionJobState) -> Result<(), StoreError> {
        self.check_writable()?;
        let value = encode("job state", state)?;
        self.job_states.insert(state.name.as_bytes().to_vec(), value);
        Ok(())
    }

    fn delete_job_state(&mut self, name: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.job_states.remove(name.as_bytes());
        Ok(())
    }

    fn list_job_states(&self) -> Result<Vec<CompactionJobState>, StoreError> {
        decode_all("job state", &self.job_states)
    }
}

impl TombstoneStore for InMemoryStore {
    fn store_tombstones(&mut self, entry: &TombstoneEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        let value = encode("tombstones", entry)?;
        self.tombstones
            .insert(entry.tombstones.name.as_bytes().to_vec(), value);
        Ok(())
    }

    fn delete_tombstones(&mut self, name: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tombstones.remove(name.as_bytes());
        Ok(())
    }

    fn list_tombstones(&self) -> Result<Vec<TombstoneEntry>, StoreError> {
        let mut entries: Vec<TombstoneEntry> = decode_all("tombstones", &self.tombstones)?;
        entries.sort_by(|a, b| {
            (a.index, &a.tombstones.name).cmp(&(b.index, &b.tombstones.name))
        });
        Ok(entries)
    }
}
