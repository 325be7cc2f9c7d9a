//! Storage seen by the metastore apply path.
//!
//! The compaction stores are extended with the block index. [`MemoryStore`]
//! is `Clone`, so a caller can apply an entry to a copy and keep the copy
//! only if the whole entry succeeded, which is how [`crate::LocalLog`]
//! models a storage transaction.

use std::collections::BTreeMap;

use pyrite_compaction::store::{InMemoryStore, JobStore, QueueStore, TombstoneStore};
use pyrite_compaction::{CompactionStore, StoreError, TombstoneEntry};
use pyrite_types::{BlockEntry, BlockId, BlockMeta, CompactionJobPlan, CompactionJobState, LogIndex};

/// Persistence of the block index.
pub trait IndexStore {
    fn store_block(&mut self, block: &BlockMeta) -> Result<(), StoreError>;

    fn delete_block(&mut self, tenant: &str, shard: u32, id: &BlockId) -> Result<(), StoreError>;

    /// Returns all blocks ordered by tenant, shard and ID.
    fn list_blocks(&self) -> Result<Vec<BlockMeta>, StoreError>;
}

/// Everything the metastore persists.
pub trait MetastoreStore: CompactionStore + IndexStore {}

impl<T: CompactionStore + IndexStore + ?Sized> MetastoreStore for T {}

/// In-memory [`MetastoreStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    compaction: InMemoryStore,
    blocks: BTreeMap<Vec<u8>, Vec<u8>>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
        self.compaction.set_fail_writes(fail);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The compaction buckets.
    pub fn compaction(&self) -> &InMemoryStore {
        &self.compaction
    }
}

fn block_key(tenant: &str, shard: u32, id: &BlockId) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + id.as_str().len() + 5);
    key.extend_from_slice(tenant.as_bytes());
    key.push(0);
    key.extend_from_slice(&shard.to_be_bytes());
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

impl IndexStore for MemoryStore {
    fn store_block(&mut self, block: &BlockMeta) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        let value = postcard::to_allocvec(block).map_err(|source| StoreError::Encode {
            what: "block",
            source,
        })?;
        self.blocks
            .insert(block_key(&block.tenant, block.shard, &block.id), value);
        Ok(())
    }

    fn delete_block(&mut self, tenant: &str, shard: u32, id: &BlockId) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.blocks.remove(&block_key(tenant, shard, id));
        Ok(())
    }

    fn list_blocks(&self) -> Result<Vec<BlockMeta>, StoreError> {
        self.blocks
            .values()
            .map(|bytes| {
                postcard::from_bytes(bytes).map_err(|source| StoreError::Decode {
                    what: "block",
                    source,
                })
            })
            .collect()
    }
}

impl QueueStore for MemoryStore {
    fn store_entry(&mut self, entry: &BlockEntry) -> Result<(), StoreError> {
        self.compaction.store_entry(entry)
    }

    fn delete_entry(&mut self, index: LogIndex, id: &BlockId) -> Result<(), StoreError> {
        self.compaction.delete_entry(index, id)
    }

    fn list_entries(&self) -> Result<Vec<BlockEntry>, StoreError> {
        self.compaction.list_entries()
    }
}

impl JobStore for MemoryStore {
    fn store_job_plan(&mut self, plan: &CompactionJobPlan) -> Result<(), StoreError> {
        self.compaction.store_job_plan(plan)
    }

    fn get_job_plan(&self, name: &str) -> Result<Option<CompactionJobPlan>, StoreError> {
        self.compaction.get_job_plan(name)
    }

    fn delete_job_plan(&mut self, name: &str) -> Result<(), StoreError> {
        self.compaction.delete_job_plan(name)
    }

    fn store_job_state(&mut self, state: &CompactionJobState) -> Result<(), StoreError> {
        self.compaction.store_job_state(state)
    }

    fn delete_job_state(&mut self, name: &str) -> Result<(), StoreError> {
        self.compaction.delete_job_state(name)
    }

    fn list_job_states(&self) -> Result<Vec<CompactionJobState>, StoreError> {
        self.compaction.list_job_states()
    }
}

impl TombstoneStore for MemoryStore {
    fn store_tombstones(&mut self, entry: &TombstoneEntry) -> Result<(), StoreError> {
        self.compaction.store_tombstones(entry)
    }

    fn delete_tombstones(&mut self, name: &str) -> Result<(), StoreError> {
        self.compaction.delete_tombstones(name)
    }

    fn list_tombstones(&self) -> Result<Vec<TombstoneEntry>, StoreError> {
        self.compaction.list_tombstones()
    }
}
