use std::collections::BTreeMap;
use std::sync::Arc;

use spendroll::{AggregationEngine, FeatureSnapshot, LatestSnapshots, RawEvent, ShardedIngest};

fn raw(id: usize, customer: usize, day: usize, cents: usize) -> RawEvent {
    RawEvent {
        event_id: Some(format!("e{id}")),
        customer_id: Some(format!("C{customer:03}")),
        event_time: Some(format!("2026-03-{:02}T{:02}:30:00Z", 1 + day % 28, id % 24)),
        event_type: Some("transaction".to_string()),
        amount: Some(serde_json::json!(format!("{}.{:02}", cents / 100, cents % 100))),
    }
}

/// Per-customer event lists, each in a fixed order.
fn feed(customers: usize, per_customer: usize) -> Vec<Vec<RawEvent>> {
    (0..customers)
        .map(|c| {
            (0..per_customer)
                .map(|i| {
                    let id = c * per_customer + i;
                    raw(id, c, i * 3 + c, 100 + id * 7)
                })
                .collect()
        })
        .collect()
}

/// Merge per-customer lists with a deterministic stride so that customers
/// interleave differently for each `seed`.
fn interleave(lists: &[Vec<RawEvent>], seed: usize) -> Vec<RawEvent> {
    let mut cursors = vec![0_usize; lists.len()];
    let mut out = Vec::new();
    let mut pick = seed;
    let remaining = |cursors: &[usize]| {
        cursors
            .iter()
            .zip(lists)
            .filter(|(cursor, list)| **cursor < list.len())
            .count()
    };
    while remaining(&cursors) > 0 {
        pick = (pick * 31 + 17) % lists.len();
        while cursors[pick] >= lists[pick].len() {
            pick = (pick + 1) % lists.len();
        }
        out.push(lists[pick][cursors[pick]].clone());
        cursors[pick] += 1;
    }
    out
}

fn run_single(events: Vec<RawEvent>) -> (AggregationEngine, BTreeMap<String, FeatureSnapshot>) {
    let engine = AggregationEngine::default();
    let mut latest = LatestSnapshots::new();
    engine.run(events, &mut latest).expect("run");
    let snapshots = engine.snapshots();
    (engine, snapshots)
}

#[test]
fn cross_customer_interleaving_does_not_matter() {
    let lists = feed(12, 20);
    let (reference_engine, reference) = run_single(interleave(&lists, 0));
    assert_eq!(reference.len(), 12);

    for seed in 1..6 {
        let (engine, snapshots) = run_single(interleave(&lists, seed));
        assert_eq!(snapshots, reference, "seed {seed}");
        assert_eq!(engine.export(), reference_engine.export(), "seed {seed}");
    }
}

#[test]
fn sharded_run_matches_single_threaded() {
    let lists = feed(25, 16);
    let events = interleave(&lists, 3);
    let (single, reference) = run_single(events.clone());

    for workers in [1, 2, 4, 7] {
        let engine = Arc::new(AggregationEngine::default());
        let report = ShardedIngest::new(Arc::clone(&engine), workers)
            .channel_capacity(8)
            .run(events.clone(), |_| LatestSnapshots::new())
            .expect("sharded run");

        assert_eq!(report.total_events, events.len() as u64);
        assert_eq!(report.outcomes(), single.stats(), "workers {workers}");
        assert_eq!(engine.snapshots(), reference, "workers {workers}");

        let mut merged = LatestSnapshots::new();
        for sink in report.sinks {
            merged.merge(sink);
        }
        assert_eq!(merged.into_inner(), reference, "workers {workers}");
    }
}

#[test]
fn duplicates_across_workers_apply_once() {
    let lists = feed(10, 10);
    let mut events = interleave(&lists, 2);
    let replay = events.clone();
    events.extend(replay);

    let engine = Arc::new(AggregationEngine::default());
    let report = ShardedIngest::new(Arc::clone(&engine), 4)
        .run(events, |_| Vec::<FeatureSnapshot>::new())
        .expect("sharded run");

    assert_eq!(report.outcomes().applied, 100);
    assert_eq!(report.outcomes().duplicates, 100);
    let published: usize = report.sinks.iter().map(Vec::len).sum();
    assert_eq!(published, 100);
    assert_eq!(engine.seen().len(), 100);
}
