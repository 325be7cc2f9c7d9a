//! Tombstones awaiting physical cleanup.
//!
//! A completed job leaves its source blocks behind in object storage. They
//! are recorded here as one [`TombstoneEntry`] named after the job, and
//! later attached to a new job for the same tenant and shard, whose worker
//! deletes the objects. The entry is claimed by that job when its plan is
//! committed and dropped when the job completes. A cancelled job releases
//! its claims.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use pyrite_types::{BlockTombstones, LogIndex, Timestamp};
use serde::{Deserialize, Serialize};

/// A persisted set of tombstones plus its claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneEntry {
    /// Log index of the entry that created the tombstones.
    pub index: LogIndex,
    pub created_at: Timestamp,
    pub tombstones: BlockTombstones,
    /// Job currently responsible for deleting the blocks.
    pub claimed_by: Option<String>,
}

type ShardKey = (String, u32);

/// In-memory index of tombstone entries.
#[derive(Debug, Default)]
pub struct TombstoneQueue {
    entries: BTreeMap<String, TombstoneEntry>,
    /// Per tenant/shard, entries in creation order.
    shards: BTreeMap<ShardKey, BTreeSet<(LogIndex, String)>>,
}

impl TombstoneQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TombstoneEntry> {
        self.entries.get(name)
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, entry: TombstoneEntry) {
        let name = entry.tombstones.name.clone();
        let shard = (entry.tombstones.tenant.clone(), entry.tombstones.shard);
        self.shards
            .entry(shard)
            .or_default()
            .insert((entry.index, name.clone()));
        self.entries.insert(name, entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<TombstoneEntry> {
        let entry = self.entries.remove(name)?;
        let shard = (entry.tombstones.tenant.clone(), entry.tombstones.shard);
        if let Some(names) = self.shards.get_mut(&shard) {
            names.remove(&(entry.index, name.to_string()));
            if names.is_empty() {
                self.shards.remove(&shard);
            }
        }
        Some(entry)
    }

    /// Sets or clears the claim of an entry; returns the updated entry.
    pub fn set_claim(&mut self, name: &str, job: Option<&str>) -> Option<&TombstoneEntry> {
        let entry = self.entries.get_mut(name)?;
        entry.claimed_by = job.map(str::to_string);
        Some(entry)
    }

    /// Unclaimed entries of a tenant/shard that are at least `delay` old at
    /// `now`, oldest first.
    pub fn eligible<'a>(
        &'a self,
        tenant: &str,
        shard: u32,
        now: Timestamp,
        delay: Duration,
    ) -> impl Iterator<Item = &'a TombstoneEntry> {
        self.shards
            .get(&(tenant.to_string(), shard))
            .into_iter()
            .flatten()
            .filter_map(|(_, name)| self.entries.get(name))
            .filter(move |entry| {
                entry.claimed_by.is_none() && now.saturating_since(entry.created_at) >= delay
            })
    }

    /// All entries, by name.
    pub fn iter(&self) -> impl Iterator<Item = &TombstoneEntry> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.shards.clear();
    }
}
