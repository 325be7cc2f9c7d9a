//! Cross-module tests for pyrite-compaction
//!
//! Blocks go in through the compactor, jobs come out of the planner and
//! run through the scheduler, the way the metastore drives them.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use pyrite_types::{
    BlockId, BlockMeta, CompactedBlocks, CompactionJobPlan, CompactionJobStatusUpdate,
    CompactionKey, CompactionPlanUpdate, LogIndex, Timestamp,
};

use crate::compactor::Compactor;
use crate::config::{CompactorConfig, LevelConfig, SchedulerConfig};
use crate::metrics::CompactionMetrics;
use crate::planner::job_name;
use crate::scheduler::Scheduler;
use crate::store::InMemoryStore;

// ============================================================================
// Test Helpers
// ============================================================================

fn compactor_config(batch: usize) -> CompactorConfig {
    CompactorConfig {
        levels: vec![LevelConfig::new(batch, 0)],
        default_level: LevelConfig::new(batch, 0),
        max_compaction_level: 2,
        tombstone_cleanup_delay_ms: 0,
    }
}

fn compactor(batch: usize) -> Compactor {
    Compactor::new(compactor_config(batch), Arc::new(CompactionMetrics::new()))
}

fn key(tenant: &str) -> CompactionKey {
    CompactionKey::new(tenant, 1, 0)
}

fn add(c: &Compactor, store: &mut InMemoryStore, index: u64, id: &str, tenant: &str) -> bool {
    c.add_block(
        store,
        LogIndex::new(index),
        Timestamp::from_millis(index),
        &BlockMeta::new(id, tenant, 1, 0),
    )
    .expect("add_block")
}

/// Removes blocks the way a committed plan does.
fn remove(c: &Compactor, store: &mut InMemoryStore, tenant: &str, ids: &[&str]) {
    let plan = CompactionJobPlan {
        name: format!("remove-{}", ids.join("-")),
        tenant: tenant.into(),
        shard: 1,
        compaction_level: 0,
        source_blocks: ids.iter().map(|id| BlockId::from(*id)).collect(),
        tombstones: vec![],
    };
    c.planned(store, &plan).expect("planned");
}

fn plan_all(c: &Compactor) -> Vec<CompactionJobPlan> {
    let mut plan = c.new_plan(Timestamp::EPOCH);
    std::iter::from_fn(|| plan.create_job()).collect()
}

fn ids(blocks: &[BlockId]) -> Vec<&str> {
    blocks.iter().map(BlockId::as_str).collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn third_block_flushes_batch_into_a_job() {
    let c = compactor(3);
    let mut store = InMemoryStore::new();
    add(&c, &mut store, 1, "1", "t");
    add(&c, &mut store, 2, "2", "t");
    assert!(plan_all(&c).is_empty());

    add(&c, &mut store, 3, "3", "t");
    let jobs = plan_all(&c);
    assert_eq!(jobs.len(), 1);
    assert_eq!(ids(&jobs[0].source_blocks), ["1", "2", "3"]);
}

#[test]
fn invalidated_batch_is_skipped() {
    let c = compactor(3);
    let mut store = InMemoryStore::new();
    for (i, id) in ["1", "2", "3"].iter().enumerate() {
        add(&c, &mut store, i as u64 + 1, id, "a");
    }
    for (i, id) in ["4", "5", "6"].iter().enumerate() {
        add(&c, &mut store, i as u64 + 4, id, "b");
    }
    remove(&c, &mut store, "a", &["1", "2"]);

    let jobs = plan_all(&c);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].tenant, "b");
    assert_eq!(ids(&jobs[0].source_blocks), ["4", "5", "6"]);
    assert_eq!(c.staged_blocks(&key("a")), [BlockId::from("3")]);
}

#[test]
fn lowest_level_is_planned_first() {
    let c = compactor(2);
    let mut store = InMemoryStore::new();
    for (i, (id, level)) in [("h1", 1), ("h2", 1), ("l1", 0), ("l2", 0)].iter().enumerate() {
        c.add_block(
            &mut store,
            LogIndex::new(i as u64 + 1),
            Timestamp::EPOCH,
            &BlockMeta::new(*id, "t", 1, *level),
        )
        .expect("add_block");
    }
    let jobs = plan_all(&c);
    assert_eq!(jobs[0].compaction_level, 0);
    assert_eq!(jobs[1].compaction_level, 1);
}

/// Runs the full job cycle: plan, commit, assign, lose the worker,
/// reassign, complete.
#[test]
fn job_survives_worker_loss() {
    let metrics = Arc::new(CompactionMetrics::new());
    let c = Compactor::new(compactor_config(3), Arc::clone(&metrics));
    let s = Scheduler::new(
        SchedulerConfig {
            max_failures: 3,
            lease_duration_ms: 10_000,
            max_queue_size: 0,
        },
        Arc::clone(&metrics),
    );
    let mut store = InMemoryStore::new();
    for (i, id) in ["1", "2", "3"].iter().enumerate() {
        add(&c, &mut store, i as u64 + 1, id, "t");
    }

    let propose = |store: &InMemoryStore, token: u64, now_ms: u64, updates: &[CompactionJobStatusUpdate]| {
        let now = Timestamp::from_millis(now_ms);
        let mut schedule = s.new_schedule(store, LogIndex::new(token), now);
        for update in updates {
            schedule.update_job(update).expect("update_job");
        }
        let mut plan = c.new_plan(now);
        while let Some(job) = plan.create_job() {
            schedule.add_job(job);
        }
        schedule.assign_job().expect("assign_job");
        schedule.into_update()
    };
    let commit = |store: &mut InMemoryStore, update: &CompactionPlanUpdate| {
        let applied = s.update_schedule(store, update).expect("update_schedule");
        for plan in &applied.new_jobs {
            c.planned(store, plan).expect("planned");
        }
        applied
    };

    // Worker A receives the job with token 5.
    let update = propose(&store, 5, 0, &[]);
    commit(&mut store, &update);
    let name = job_name(&key("t"), &[BlockId::from("1"), BlockId::from("2"), BlockId::from("3")]);
    assert_eq!(s.job(&name).map(|j| j.token), Some(LogIndex::new(5)));
    assert!(c.staged_blocks(&key("t")).is_empty());
    assert_eq!(store.entry_count(), 0);

    // A never reports; B takes over with token 6.
    let update = propose(&store, 6, 10_000, &[]);
    commit(&mut store, &update);
    let job = s.job(&name).expect("job");
    assert_eq!((job.token, job.failures), (LogIndex::new(6), 1));

    // A's late success is dropped, B's is accepted.
    let late = CompactionJobStatusUpdate::success(
        name.clone(),
        LogIndex::new(5),
        CompactedBlocks {
            tenant: "t".into(),
            shard: 1,
            source_blocks: vec![],
            new_blocks: vec![],
        },
    );
    let update = propose(&store, 7, 10_001, &[late]);
    assert!(update.completed_jobs.is_empty());

    let done = CompactionJobStatusUpdate::success(
        name.clone(),
        LogIndex::new(6),
        CompactedBlocks {
            tenant: "t".into(),
            shard: 1,
            source_blocks: vec![],
            new_blocks: vec![BlockMeta::new("merged", "t", 1, 1)],
        },
    );
    let update = propose(&store, 8, 10_002, &[done]);
    let applied = commit(&mut store, &update);
    assert_eq!(applied.completed_jobs.len(), 1);
    assert!(s.job(&name).is_none());

    let snapshot = metrics.snapshot(0);
    assert_eq!(snapshot.blocks_added, 3);
    assert_eq!(snapshot.jobs_added, 1);
    assert_eq!(snapshot.jobs_assigned, 1);
    assert_eq!(snapshot.jobs_reassigned, 1);
    assert_eq!(snapshot.jobs_completed, 1);
}

#[test]
fn replanning_after_commit_yields_nothing() {
    let c = compactor(2);
    let mut store = InMemoryStore::new();
    add(&c, &mut store, 1, "a", "t");
    add(&c, &mut store, 2, "b", "t");
    let jobs = plan_all(&c);
    assert_eq!(jobs.len(), 1);
    assert!(c.is_staged(&jobs[0]));

    c.planned(&mut store, &jobs[0]).expect("planned");
    assert!(!c.is_staged(&jobs[0]));
    assert!(plan_all(&c).is_empty());
}

// ============================================================================
// Properties
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Push { tenant: usize, block: usize },
    Remove { tenant: usize, block: usize },
}

fn arb_ops(allow_removals: bool) -> impl Strategy<Value = Vec<Op>> {
    let op = (any::<bool>(), 0usize..3, 0usize..12).prop_map(move |(remove, tenant, block)| {
        if remove && allow_removals {
            Op::Remove { tenant, block }
        } else {
            Op::Push { tenant, block }
        }
    });
    prop::collection::vec(op, 0..80)
}

const TENANTS: [&str; 3] = ["a", "b", "c"];

fn run_ops(c: &Compactor, store: &mut InMemoryStore, ops: &[Op]) {
    for (i, op) in ops.iter().enumerate() {
        match *op {
            Op::Push { tenant, block } => {
                add(c, store, i as u64 + 1, &format!("b{block}"), TENANTS[tenant]);
            }
            Op::Remove { tenant, block } => {
                remove(c, store, TENANTS[tenant], &[&format!("b{block}")]);
            }
        }
    }
}

proptest! {
    #[test]
    fn pushes_are_unique_and_fifo(blocks in prop::collection::vec(0usize..20, 0..60)) {
        let c = compactor(4);
        let mut store = InMemoryStore::new();
        let mut expected = Vec::new();
        let mut seen = HashSet::new();
        for (i, block) in blocks.iter().enumerate() {
            let id = format!("b{block}");
            let accepted = add(&c, &mut store, i as u64 + 1, &id, "t");
            prop_assert_eq!(accepted, seen.insert(id.clone()));
            if accepted {
                expected.push(BlockId::from(id));
            }
        }
        prop_assert_eq!(c.staged_blocks(&key("t")), expected);
    }

    #[test]
    fn job_name_is_order_independent(
        blocks in prop::collection::hash_set("[a-z0-9]{1,8}", 1..10),
        seed in any::<u64>(),
    ) {
        let mut ordered: Vec<BlockId> = blocks.into_iter().map(BlockId::from).collect();
        ordered.sort();
        let mut shuffled = ordered.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();
        prop_assert_eq!(job_name(&key("t"), &ordered), job_name(&key("t"), &shuffled));
    }

    #[test]
    fn planned_jobs_never_share_blocks(ops in arb_ops(true)) {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        run_ops(&c, &mut store, &ops);
        let mut seen = HashSet::new();
        for job in plan_all(&c) {
            prop_assert!(job.source_blocks.len() <= 3);
            for id in job.source_blocks {
                prop_assert!(seen.insert((job.tenant.clone(), id)));
            }
        }
    }

    #[test]
    fn restore_preserves_staged_order(ops in arb_ops(true)) {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        run_ops(&c, &mut store, &ops);

        let restored = compactor(3);
        restored.restore(&store).expect("restore");
        for tenant in TENANTS {
            prop_assert_eq!(restored.staged_blocks(&key(tenant)), c.staged_blocks(&key(tenant)));
        }
        prop_assert_eq!(restored.stats().staged_blocks(), c.stats().staged_blocks());
    }

    #[test]
    fn restore_reproduces_batches_without_removals(ops in arb_ops(false)) {
        let c = compactor(3);
        let mut store = InMemoryStore::new();
        run_ops(&c, &mut store, &ops);

        let restored = compactor(3);
        restored.restore(&store).expect("restore");
        prop_assert_eq!(restored.stats(), c.stats());
        prop_assert_eq!(plan_all(&restored), plan_all(&c));
    }
}
