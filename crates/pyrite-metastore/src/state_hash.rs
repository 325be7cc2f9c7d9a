//! Deterministic hashing of metastore state.
//!
//! Two replicas that applied the same log prefix must report the same hash,
//! and so must a replica restored from its store. The hash therefore covers
//! what the store can reproduce:
//! - Staged blocks of every compaction key, in arrival order, with the log
//!   index each was staged at
//! - Tombstone entries and their claims
//! - Scheduler job states
//! - The block index
//!
//! Batch boundaries are left out: restore regroups staged blocks into
//! fresh batches.

use blake3::Hasher;
use pyrite_types::{BlockMeta, CompactionJobState, CompactionJobStatus, CompactionKey};

use crate::metastore::Metastore;

impl Metastore {
    /// Computes a 32-byte BLAKE3 hash of the replica's state.
    ///
    /// Every collection is visited in a fixed order (key order, name order
    /// or arrival order), so the result depends only on the state.
    pub fn compute_state_hash(&self) -> [u8; 32] {
        let mut hasher = Hasher::new();

        // Staged blocks, level by level, key by key
        self.compactor().inspect(|queue, tombstones| {
            for level in queue.levels() {
                let keys: Vec<&CompactionKey> = level
                    .keys()
                    .filter(|key| !level.staged_blocks(key).is_empty())
                    .collect();
                // Drained levels are not recreated by restore.
                if keys.is_empty() {
                    continue;
                }
                hasher.update(&level.level().to_le_bytes());
                hasher.update(&(keys.len() as u64).to_le_bytes());
                for key in keys {
                    update_str(&mut hasher, &key.tenant);
                    hasher.update(&key.shard.to_le_bytes());
                    let blocks = level.staged_blocks(key);
                    hasher.update(&(blocks.len() as u64).to_le_bytes());
                    for id in &blocks {
                        update_str(&mut hasher, id.as_str());
                        let index = level.staged_index(key, id).map_or(0, |i| i.as_u64());
                        hasher.update(&index.to_le_bytes());
                    }
                }
            }

            // Tombstones, by name
            hasher.update(&(tombstones.len() as u64).to_le_bytes());
            for entry in tombstones.iter() {
                update_str(&mut hasher, &entry.tombstones.name);
                update_str(&mut hasher, &entry.tombstones.tenant);
                hasher.update(&entry.tombstones.shard.to_le_bytes());
                hasher.update(&entry.tombstones.compaction_level.to_le_bytes());
                hasher.update(&entry.index.as_u64().to_le_bytes());
                hasher.update(&entry.created_at.as_nanos().to_le_bytes());
                hasher.update(&(entry.tombstones.blocks.len() as u64).to_le_bytes());
                for id in &entry.tombstones.blocks {
                    update_str(&mut hasher, id.as_str());
                }
                match &entry.claimed_by {
                    Some(job) => {
                        hasher.update(&[1u8]);
                        update_str(&mut hasher, job);
                    }
                    None => {
                        hasher.update(&[0u8]);
                    }
                }
            }
        });

        // Jobs, by name
        let jobs = self.scheduler().jobs();
        hasher.update(&(jobs.len() as u64).to_le_bytes());
        for job in &jobs {
            hash_job(&mut hasher, job);
        }

        // Block index, by tenant, shard and ID
        let index = self.index();
        hasher.update(&(index.len() as u64).to_le_bytes());
        for block in index.iter() {
            hash_block(&mut hasher, block);
        }

        *hasher.finalize().as_bytes()
    }
}

fn update_str(hasher: &mut Hasher, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn status_tag(status: CompactionJobStatus) -> u8 {
    match status {
        CompactionJobStatus::Unspecified => 0,
        CompactionJobStatus::InProgress => 1,
        CompactionJobStatus::Success => 2,
        CompactionJobStatus::Failure => 3,
        CompactionJobStatus::Cancelled => 4,
    }
}

fn hash_job(hasher: &mut Hasher, job: &CompactionJobState) {
    update_str(hasher, &job.name);
    hasher.update(&job.compaction_level.to_le_bytes());
    hasher.update(&[status_tag(job.status)]);
    hasher.update(&job.token.as_u64().to_le_bytes());
    hasher.update(&job.lease_expires_at.as_nanos().to_le_bytes());
    hasher.update(&job.failures.to_le_bytes());
    hasher.update(&job.added_at.as_nanos().to_le_bytes());
}

fn hash_block(hasher: &mut Hasher, block: &BlockMeta) {
    update_str(hasher, &block.tenant);
    hasher.update(&block.shard.to_le_bytes());
    update_str(hasher, block.id.as_str());
    hasher.update(&block.compaction_level.to_le_bytes());
    hasher.update(&block.min_time.to_le_bytes());
    hasher.update(&block.max_time.to_le_bytes());
    hasher.update(&block.size.to_le_bytes());
}
