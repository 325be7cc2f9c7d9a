//! Authoritative index of live blocks, per tenant and shard.

use std::collections::BTreeMap;

use pyrite_types::{BlockId, BlockMeta, CompactedBlocks};

type Shard = (String, u32);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    shards: BTreeMap<Shard, BTreeMap<BlockId, BlockMeta>>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.shards.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn contains(&self, tenant: &str, shard: u32, id: &BlockId) -> bool {
        self.get(tenant, shard, id).is_some()
    }

    pub fn get(&self, tenant: &str, shard: u32, id: &BlockId) -> Option<&BlockMeta> {
        self.shards.get(&(tenant.to_string(), shard))?.get(id)
    }

    /// Inserts a block. Returns false if it was already present.
    pub fn insert(&mut self, block: BlockMeta) -> bool {
        let blocks = self
            .shards
            .entry((block.tenant.clone(), block.shard))
            .or_default();
        if blocks.contains_key(&block.id) {
            return false;
        }
        blocks.insert(block.id.clone(), block);
        true
    }

    pub fn remove(&mut self, tenant: &str, shard: u32, id: &BlockId) -> Option<BlockMeta> {
        let key = (tenant.to_string(), shard);
        let blocks = self.shards.get_mut(&key)?;
        let removed = blocks.remove(id);
        if blocks.is_empty() {
            self.shards.remove(&key);
        }
        removed
    }

    /// Swaps the sources of a compaction for its outputs.
    pub fn replace(&mut self, compacted: &CompactedBlocks) {
        for id in &compacted.source_blocks {
            self.remove(&compacted.tenant, compacted.shard, id);
        }
        for block in &compacted.new_blocks {
            self.insert(block.clone());
        }
    }

    /// Metadata of the given blocks, skipping unknown ones.
    pub fn find<'a>(
        &'a self,
        tenant: &str,
        shard: u32,
        ids: impl IntoIterator<Item = &'a BlockId>,
    ) -> Vec<BlockMeta> {
        let Some(blocks) = self.shards.get(&(tenant.to_string(), shard)) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| blocks.get(id))
            .cloned()
            .collect()
    }

    /// All blocks ordered by tenant, shard and ID.
    pub fn iter(&self) -> impl Iterator<Item = &BlockMeta> {
        self.shards.values().flat_map(BTreeMap::values)
    }

    pub fn clear(&mut self) {
        self.shards.clear();
    }
}
