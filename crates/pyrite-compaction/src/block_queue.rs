//! Arrival-ordered staging of blocks awaiting compaction.
//!
//! Blocks are grouped into fixed-capacity batches, one open batch per
//! [`CompactionKey`]. Once sealed, a batch belongs to two doubly-linked
//! lists at once:
//!
//! - the level-wide arrival list, which interleaves keys fairly, and
//! - the per-key arrival list, which lets the planner exhaust one key's
//!   history before moving to the next.
//!
//! Batches live in an arena and link to each other by index, so removing a
//! batch from both lists is O(1). Removed blocks are never shifted out of
//! their batch: the slot is cleared in place, keeping every `BlockRef`
//! valid. A batch whose last live block is removed is unlinked and its
//! arena slot recycled.
//!
//! # Invariants
//!
//! - A block ID appears at most once among the live slots of a key.
//! - Only sealed batches are linked; the open batch of a key is reachable
//!   only through its `StagedBlocks`.
//! - Per-key state is never dropped once created.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use pyrite_types::{BlockEntry, BlockId, CompactionKey, LogIndex, Timestamp};

use crate::strategy::{BatchInfo, CompactionStrategy, FlushReason};

/// Index of a batch in its level's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BatchId(usize);

#[derive(Debug)]
struct Batch {
    key: CompactionKey,
    /// `None` marks a removed block.
    slots: Vec<Option<BlockId>>,
    live: usize,
    created_at: Timestamp,
    flushed: Option<FlushReason>,
    // Level-wide arrival list.
    prev: Option<BatchId>,
    next: Option<BatchId>,
    // Per-key arrival list.
    key_prev: Option<BatchId>,
    key_next: Option<BatchId>,
}

impl Batch {
    fn new(key: CompactionKey, created_at: Timestamp) -> Self {
        Self {
            key,
            slots: Vec::new(),
            live: 0,
            created_at,
            flushed: None,
            prev: None,
            next: None,
            key_prev: None,
            key_next: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockRef {
    batch: BatchId,
    slot: usize,
    index: LogIndex,
}

#[derive(Debug, Default)]
struct StagedBlocks {
    refs: HashMap<BlockId, BlockRef>,
    open: Option<BatchId>,
    head: Option<BatchId>,
    tail: Option<BatchId>,
}

/// Staged blocks of a single compaction level.
#[derive(Debug)]
pub struct BlockQueue {
    level: u32,
    arena: Vec<Option<Batch>>,
    free: Vec<usize>,
    staged: BTreeMap<CompactionKey, StagedBlocks>,
    head: Option<BatchId>,
    tail: Option<BatchId>,
    sealed: usize,
}

impl BlockQueue {
    fn new(level: u32) -> Self {
        Self {
            level,
            arena: Vec::new(),
            free: Vec::new(),
            staged: BTreeMap::new(),
            head: None,
            tail: None,
            sealed: 0,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Returns true if no sealed batch is waiting.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Iterates sealed batches in the order they were sealed.
    pub fn batches(&self) -> BatchIter<'_> {
        BatchIter {
            queue: self,
            next: self.head,
        }
    }

    /// Iterates live blocks starting at `batch` and continuing through the
    /// later sealed batches of the same key.
    pub(crate) fn blocks_from(&self, batch: BatchId) -> BlockIter<'_> {
        BlockIter {
            queue: self,
            batch: Some(batch),
            slot: 0,
            seen: HashSet::new(),
        }
    }

    pub(crate) fn batch_view(&self, id: BatchId) -> Option<BatchView<'_>> {
        self.batch(id).map(|batch| BatchView { id, batch })
    }

    /// Keys that ever received a block at this level, in key order.
    pub fn keys(&self) -> impl Iterator<Item = &CompactionKey> {
        self.staged.keys()
    }

    pub fn contains(&self, key: &CompactionKey, id: &BlockId) -> bool {
        self.staged
            .get(key)
            .is_some_and(|staged| staged.refs.contains_key(id))
    }

    /// Log index a staged block was added at.
    pub fn staged_index(&self, key: &CompactionKey, id: &BlockId) -> Option<LogIndex> {
        self.staged.get(key)?.refs.get(id).map(|r| r.index)
    }

    /// All live blocks of `key` in arrival order: sealed batches first, then
    /// the open batch.
    pub fn staged_blocks(&self, key: &CompactionKey) -> Vec<BlockId> {
        let Some(staged) = self.staged.get(key) else {
            return Vec::new();
        };
        let mut blocks: Vec<BlockId> = match staged.head {
            Some(head) => self.blocks_from(head).cloned().collect(),
            None => Vec::new(),
        };
        if let Some(open) = staged.open.and_then(|id| self.batch(id)) {
            blocks.extend(open.slots.iter().flatten().cloned());
        }
        blocks
    }

    pub fn stats(&self) -> LevelStats {
        LevelStats {
            level: self.level,
            keys: self.staged.len(),
            staged_blocks: self.staged.values().map(|s| s.refs.len()).sum(),
            sealed_batches: self.sealed,
            open_batches: self.staged.values().filter(|s| s.open.is_some()).count(),
        }
    }

    fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.arena.get(id.0).and_then(Option::as_ref)
    }

    fn batch_mut(&mut self, id: BatchId) -> Option<&mut Batch> {
        self.arena.get_mut(id.0).and_then(Option::as_mut)
    }

    fn alloc(&mut self, batch: Batch) -> BatchId {
        match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(batch);
                BatchId(slot)
            }
            None => {
                self.arena.push(Some(batch));
                BatchId(self.arena.len() - 1)
            }
        }
    }

    fn release(&mut self, id: BatchId) {
        if let Some(slot) = self.arena.get_mut(id.0) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    fn push(&mut self, entry: &BlockEntry, strategy: &dyn CompactionStrategy) -> bool {
        let key = entry.key();
        let staged = self.staged.entry(key.clone()).or_default();
        if staged.refs.contains_key(&entry.id) {
            return false;
        }
        let open = staged.open;

        let batch_id = match open {
            Some(id) => id,
            None => self.alloc(Batch::new(key.clone(), entry.appended_at)),
        };
        let level = self.level;
        let Some(batch) = self.batch_mut(batch_id) else {
            return false;
        };
        let slot = batch.slots.len();
        batch.slots.push(Some(entry.id.clone()));
        batch.live += 1;
        let info = BatchInfo {
            level,
            size: batch.slots.len(),
            created_at: batch.created_at,
        };

        if let Some(staged) = self.staged.get_mut(&key) {
            staged.open = Some(batch_id);
            staged.refs.insert(
                entry.id.clone(),
                BlockRef {
                    batch: batch_id,
                    slot,
                    index: entry.index,
                },
            );
        }

        if let Some(reason) = strategy.flush(info, entry.appended_at) {
            self.seal(&key, batch_id, reason);
        }
        true
    }

    /// Moves the open batch of `key` to the tail of both arrival lists.
    fn seal(&mut self, key: &CompactionKey, id: BatchId, reason: FlushReason) {
        let global_tail = self.tail;
        let key_tail = self.staged.get(key).and_then(|s| s.tail);

        if let Some(batch) = self.batch_mut(id) {
            batch.flushed = Some(reason);
            batch.prev = global_tail;
            batch.next = None;
            batch.key_prev = key_tail;
            batch.key_next = None;
        }

        match global_tail.and_then(|t| self.batch_mut(t)) {
            Some(tail) => tail.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);

        let key_has_tail = match key_tail.and_then(|t| self.batch_mut(t)) {
            Some(tail) => {
                tail.key_next = Some(id);
                true
            }
            None => false,
        };
        if let Some(staged) = self.staged.get_mut(key) {
            if !key_has_tail {
                staged.head = Some(id);
            }
            staged.tail = Some(id);
            staged.open = None;
        }
        self.sealed += 1;
    }

    /// Removes a sealed batch from both arrival lists.
    fn unlink(&mut self, key: &CompactionKey, id: BatchId) {
        let Some(batch) = self.batch(id) else {
            return;
        };
        let (prev, next, key_prev, key_next) =
            (batch.prev, batch.next, batch.key_prev, batch.key_next);

        match prev.and_then(|p| self.batch_mut(p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.batch_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }

        let mut new_key_head = None;
        let mut new_key_tail = None;
        match key_prev.and_then(|p| self.batch_mut(p)) {
            Some(p) => p.key_next = key_next,
            None => new_key_head = Some(key_next),
        }
        match key_next.and_then(|n| self.batch_mut(n)) {
            Some(n) => n.key_prev = key_prev,
            None => new_key_tail = Some(key_prev),
        }
        if let Some(staged) = self.staged.get_mut(key) {
            if let Some(head) = new_key_head {
                staged.head = head;
            }
            if let Some(tail) = new_key_tail {
                staged.tail = tail;
            }
        }
        self.sealed -= 1;
    }

    fn remove(&mut self, key: &CompactionKey, id: &BlockId) -> Option<LogIndex> {
        let block_ref = self.staged.get_mut(key)?.refs.remove(id)?;
        let batch = self.batch_mut(block_ref.batch)?;
        if let Some(slot) = batch.slots.get_mut(block_ref.slot) {
            *slot = None;
        }
        batch.live -= 1;
        if batch.live == 0 {
            if batch.flushed.is_some() {
                self.unlink(key, block_ref.batch);
            } else if let Some(staged) = self.staged.get_mut(key) {
                staged.open = None;
            }
            self.release(block_ref.batch);
        }
        Some(block_ref.index)
    }
}

/// Read-only view of a sealed batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a> {
    id: BatchId,
    batch: &'a Batch,
}

impl<'a> BatchView<'a> {
    pub(crate) fn id(&self) -> BatchId {
        self.id
    }

    /// Next sealed batch in the level-wide arrival list.
    pub(crate) fn next(&self) -> Option<BatchId> {
        self.batch.next
    }

    pub fn key(&self) -> &'a CompactionKey {
        &self.batch.key
    }

    pub fn flush_reason(&self) -> Option<FlushReason> {
        self.batch.flushed
    }

    pub fn created_at(&self) -> Timestamp {
        self.batch.created_at
    }

    pub fn live(&self) -> usize {
        self.batch.live
    }

    /// Live blocks of this batch only.
    pub fn blocks(self) -> impl Iterator<Item = &'a BlockId> {
        self.batch.slots.iter().flatten()
    }
}

/// Walks the level-wide arrival list.
#[derive(Debug)]
pub struct BatchIter<'a> {
    queue: &'a BlockQueue,
    next: Option<BatchId>,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = BatchView<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let batch = self.queue.batch(id)?;
        self.next = batch.next;
        Some(BatchView { id, batch })
    }
}

/// Walks live blocks along the per-key arrival list.
#[derive(Debug)]
pub struct BlockIter<'a> {
    queue: &'a BlockQueue,
    batch: Option<BatchId>,
    slot: usize,
    seen: HashSet<&'a BlockId>,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = &'a BlockId;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let batch = self.queue.batch(self.batch?)?;
            match batch.slots.get(self.slot) {
                Some(slot) => {
                    self.slot += 1;
                    if let Some(id) = slot {
                        if self.seen.insert(id) {
                            return Some(id);
                        }
                    }
                }
                None => {
                    self.batch = batch.key_next;
                    self.slot = 0;
                }
            }
        }
    }
}

/// Counters describing one level of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelStats {
    pub level: u32,
    pub keys: usize,
    pub staged_blocks: usize,
    pub sealed_batches: usize,
    pub open_batches: usize,
}

/// Counters describing the whole queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub levels: Vec<LevelStats>,
}

impl QueueStats {
    pub fn staged_blocks(&self) -> usize {
        self.levels.iter().map(|l| l.staged_blocks).sum()
    }
}

/// One [`BlockQueue`] per compaction level.
#[derive(Debug)]
pub struct CompactionQueue {
    strategy: Arc<dyn CompactionStrategy>,
    levels: Vec<BlockQueue>,
}

impl CompactionQueue {
    pub fn new(strategy: Arc<dyn CompactionStrategy>) -> Self {
        Self {
            strategy,
            levels: Vec::new(),
        }
    }

    /// Stages a block. Returns false if the block is already staged under
    /// the same key.
    pub fn push(&mut self, entry: &BlockEntry) -> bool {
        let level = entry.level as usize;
        while self.levels.len() <= level {
            let next = self.levels.len() as u32;
            self.levels.push(BlockQueue::new(next));
        }
        self.levels[level].push(entry, self.strategy.as_ref())
    }

    /// Removes blocks, returning the log index each removed block was
    /// staged at. Unknown blocks are skipped.
    pub fn remove<'b>(
        &mut self,
        key: &CompactionKey,
        ids: impl IntoIterator<Item = &'b BlockId>,
    ) -> Vec<(BlockId, LogIndex)> {
        let Some(queue) = self.levels.get_mut(key.level as usize) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| queue.remove(key, id).map(|index| (id.clone(), index)))
            .collect()
    }

    pub fn contains(&self, key: &CompactionKey, id: &BlockId) -> bool {
        self.level(key.level)
            .is_some_and(|queue| queue.contains(key, id))
    }

    pub fn level(&self, level: u32) -> Option<&BlockQueue> {
        self.levels.get(level as usize)
    }

    pub fn levels(&self) -> &[BlockQueue] {
        &self.levels
    }

    pub fn staged_blocks(&self, key: &CompactionKey) -> Vec<BlockId> {
        self.level(key.level)
            .map(|queue| queue.staged_blocks(key))
            .unwrap_or_default()
    }

    pub fn strategy(&self) -> &dyn CompactionStrategy {
        self.strategy.as_ref()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            levels: self.levels.iter().map(BlockQueue::stats).collect(),
        }
    }
}
