//! # pyrite-types: Core types for `Pyrite`
//!
//! This crate contains the value types shared by the compaction core and the
//! metastore state machine:
//! - Log positions and time ([`LogIndex`], [`Timestamp`])
//! - Block identity and metadata ([`BlockId`], [`BlockMeta`], [`BlockEntry`])
//! - Partitioning ([`CompactionKey`])
//! - Tombstones ([`BlockTombstones`])
//! - Job records ([`CompactionJobPlan`], [`CompactionJobState`], [`CompactionJobStatus`])
//! - Worker protocol ([`CompactionJobStatusUpdate`], [`CompactedBlocks`], [`CompactionJob`])
//! - Replicated plan updates ([`CompactionPlanUpdate`])
//!
//! Everything here is plain data. Types that are persisted or replicated
//! derive `Serialize`/`Deserialize`.

use std::{
    borrow::Borrow,
    fmt::Display,
    time::Duration,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Log position - Copy (8-byte value)
// ============================================================================

/// Position of an entry in the replicated log.
///
/// Log indexes double as fencing tokens: the index of the entry that assigned
/// a job is the token the owning worker must present on every status update.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the index immediately following this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LogIndex> for u64 {
    fn from(index: LogIndex) -> Self {
        index.0
    }
}

// ============================================================================
// Timestamp - Copy (8-byte value)
// ============================================================================

/// Wall-clock timestamp carried by log entries.
///
/// The state machine never reads the system clock: the append time recorded
/// by the leader in each log entry is the only notion of "now", so every
/// replica evaluates leases and batch ages identically.
///
/// Stored as nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from nanoseconds since Unix epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a timestamp from milliseconds since Unix epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Returns the timestamp as nanoseconds since Unix epoch.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Returns `self + duration`, saturating at `u64::MAX` nanoseconds.
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if
    /// `earlier` is later.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ============================================================================
// Blocks
// ============================================================================

/// Identifier of an immutable data block in object storage.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlockId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BlockId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<BlockId> for String {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

impl Borrow<str> for BlockId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Metadata of a block as registered in the block index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: BlockId,
    pub tenant: String,
    pub shard: u32,
    /// Generation counter: 0 for freshly ingested blocks.
    pub compaction_level: u32,
    /// Earliest sample time covered by the block (milliseconds).
    pub min_time: i64,
    /// Latest sample time covered by the block (milliseconds).
    pub max_time: i64,
    /// Size of the block object in bytes.
    pub size: u64,
}

impl BlockMeta {
    pub fn new(id: impl Into<BlockId>, tenant: impl Into<String>, shard: u32, level: u32) -> Self {
        Self {
            id: id.into(),
            tenant: tenant.into(),
            shard,
            compaction_level: level,
            min_time: 0,
            max_time: 0,
            size: 0,
        }
    }

    pub fn compaction_key(&self) -> CompactionKey {
        CompactionKey {
            tenant: self.tenant.clone(),
            shard: self.shard,
            level: self.compaction_level,
        }
    }
}

/// Partition under which blocks are queued and planned together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompactionKey {
    pub tenant: String,
    pub shard: u32,
    pub level: u32,
}

impl CompactionKey {
    pub fn new(tenant: impl Into<String>, shard: u32, level: u32) -> Self {
        Self {
            tenant: tenant.into(),
            shard,
            level,
        }
    }
}

impl Display for CompactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/L{}", self.tenant, self.shard, self.level)
    }
}

/// A block admitted to the compaction queue.
///
/// Immutable once created. Entries are persisted keyed by `(index, id)` so a
/// restore replays them in log order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// Log index of the entry that added the block.
    pub index: LogIndex,
    pub id: BlockId,
    /// Append time of the entry that added the block.
    pub appended_at: Timestamp,
    pub tenant: String,
    pub shard: u32,
    pub level: u32,
}

impl BlockEntry {
    pub fn key(&self) -> CompactionKey {
        CompactionKey {
            tenant: self.tenant.clone(),
            shard: self.shard,
            level: self.level,
        }
    }
}

// ============================================================================
// Tombstones
// ============================================================================

/// Blocks logically deleted by a compaction, pending physical removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTombstones {
    /// Unique name; the name of the job whose completion produced them.
    pub name: String,
    pub tenant: String,
    pub shard: u32,
    pub compaction_level: u32,
    pub blocks: Vec<BlockId>,
}

// ============================================================================
// Jobs
// ============================================================================

/// Content of a compaction job: which blocks to merge, which to delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionJobPlan {
    /// Deterministic content hash, see the planner.
    pub name: String,
    pub tenant: String,
    pub shard: u32,
    pub compaction_level: u32,
    pub source_blocks: Vec<BlockId>,
    pub tombstones: Vec<BlockTombstones>,
}

/// Lifecycle status of a compaction job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum CompactionJobStatus {
    /// Planned, never assigned.
    #[default]
    Unspecified,
    /// Owned by a worker holding a lease.
    InProgress,
    Success,
    Failure,
    /// Permanently abandoned after too many failed attempts.
    Cancelled,
}

impl CompactionJobStatus {
    /// Scheduling rank: lower ranks are offered to workers first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::InProgress => 1,
            Self::Success | Self::Failure | Self::Cancelled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

impl Display for CompactionJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unspecified => "unspecified",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Scheduling state of a compaction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionJobState {
    pub name: String,
    pub compaction_level: u32,
    pub status: CompactionJobStatus,
    /// Highest fencing token issued for this job.
    pub token: LogIndex,
    pub lease_expires_at: Timestamp,
    /// Number of times the job was reassigned after a lease lapsed.
    pub failures: u32,
    pub added_at: Timestamp,
}

impl CompactionJobState {
    pub fn lease_expired(&self, now: Timestamp) -> bool {
        self.lease_expires_at <= now
    }
}

/// Blocks a worker consumed and produced for a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactedBlocks {
    pub tenant: String,
    pub shard: u32,
    pub source_blocks: Vec<BlockId>,
    pub new_blocks: Vec<BlockMeta>,
}

/// Status a worker reports for a job it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionJobStatusUpdate {
    pub name: String,
    /// Fencing token received with the assignment.
    pub token: LogIndex,
    pub status: CompactionJobStatus,
    /// Present when `status` is `Success`.
    pub compacted: Option<CompactedBlocks>,
}

impl CompactionJobStatusUpdate {
    pub fn in_progress(name: impl Into<String>, token: LogIndex) -> Self {
        Self {
            name: name.into(),
            token,
            status: CompactionJobStatus::InProgress,
            compacted: None,
        }
    }

    pub fn success(name: impl Into<String>, token: LogIndex, compacted: CompactedBlocks) -> Self {
        Self {
            name: name.into(),
            token,
            status: CompactionJobStatus::Success,
            compacted: Some(compacted),
        }
    }
}

/// A job handed to a worker, with source block metadata resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionJob {
    pub name: String,
    pub tenant: String,
    pub shard: u32,
    pub compaction_level: u32,
    pub source_blocks: Vec<BlockMeta>,
    pub tombstones: Vec<BlockTombstones>,
    pub token: LogIndex,
    pub lease_expires_at: Timestamp,
}

// ============================================================================
// Plan update (replicated)
// ============================================================================

/// A freshly planned job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCompactionJob {
    pub state: CompactionJobState,
    pub plan: CompactionJobPlan,
}

/// A job assigned (or reassigned) to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedCompactionJob {
    pub state: CompactionJobState,
    pub plan: CompactionJobPlan,
}

/// A job whose lease was renewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedCompactionJob {
    pub state: CompactionJobState,
}

/// A job reported as successfully finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedCompactionJob {
    pub state: CompactionJobState,
    pub compacted: CompactedBlocks,
}

/// A job removed without completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictedCompactionJob {
    pub state: CompactionJobState,
}

/// Proposed scheduling transitions, computed by a read-only schedule and
/// committed through the log before anything is mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompactionPlanUpdate {
    pub new_jobs: Vec<NewCompactionJob>,
    pub assigned_jobs: Vec<AssignedCompactionJob>,
    pub updated_jobs: Vec<UpdatedCompactionJob>,
    pub completed_jobs: Vec<CompletedCompactionJob>,
    pub evicted_jobs: Vec<EvictedCompactionJob>,
}

impl CompactionPlanUpdate {
    pub fn is_empty(&self) -> bool {
        self.new_jobs.is_empty()
            && self.assigned_jobs.is_empty()
            && self.updated_jobs.is_empty()
            && self.completed_jobs.is_empty()
            && self.evicted_jobs.is_empty()
    }
}
