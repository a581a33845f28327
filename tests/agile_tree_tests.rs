mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::RecordingListener;
use proptest::prelude::*;
use segread::aggregation::{Accumulator, BucketKey};
use segread::telemetry::noop_event_listener;
use segread::{
    AgileTreeReader, AgileTreeWriter, AggFunction, BufferPools, GroupByBuckets, GroupByRequest,
    MeasureAggregator, NumericValue, ReaderEvent,
};
use tempfile::{tempdir, TempDir};

fn open(key: &str) -> AgileTreeReader {
    AgileTreeReader::open(key, Arc::new(BufferPools::default()), noop_event_listener()).unwrap()
}

fn seg_key(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[test]
fn capability_check_examples() {
    let dir = tempdir().unwrap();
    let key = seg_key(&dir, "seg");
    let mut w = AgileTreeWriter::new(["city"], ["latency"]);
    for (city, lat) in [("nyc", 10), ("sf", 20), ("nyc", 5)] {
        w.add_row(&[city.as_bytes()], &[Some(NumericValue::Int(lat))]).unwrap();
    }
    w.write(&key).unwrap();
    let mut r = open(&key);

    let two_cols = GroupByRequest::new(
        ["city", "method"],
        vec![MeasureAggregator::new("latency", AggFunction::Sum)],
    );
    assert!(!r.can_use_agile_tree(&two_cols).unwrap());

    let count_only = GroupByRequest::new(["city"], vec![MeasureAggregator::count_all()]);
    assert!(r.can_use_agile_tree(&count_only).unwrap());

    let sum_latency = GroupByRequest::new(
        ["city"],
        vec![MeasureAggregator::new("latency", AggFunction::Sum)],
    );
    assert!(r.can_use_agile_tree(&sum_latency).unwrap());

    let unknown_measure = GroupByRequest::new(
        ["city"],
        vec![MeasureAggregator::new("bytes", AggFunction::Max)],
    );
    assert!(!r.can_use_agile_tree(&unknown_measure).unwrap());

    let mut out = GroupByBuckets::new(&sum_latency);
    r.apply_group_by_jit(&sum_latency, &mut out).unwrap();
    let rows = out.into_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].key, vec!["nyc".to_string()]);
    assert_eq!(rows[0].count, 2);
    assert_eq!(rows[0].values, vec![Some(NumericValue::Int(15))]);
}

#[test]
fn parity_sums_match_brute_force() {
    let dir = tempdir().unwrap();
    let key = seg_key(&dir, "seg");
    let n = 1_000i64;
    let mut w = AgileTreeWriter::new(["parity", "bucket"], ["value"]);
    for i in 0..n {
        let parity: &[u8] = if i % 2 == 0 { b"even" } else { b"odd" };
        let bucket = format!("b{}", i % 7);
        w.add_row(&[parity, bucket.as_bytes()], &[Some(NumericValue::Int(i))])
            .unwrap();
    }
    w.write(&key).unwrap();

    let req = GroupByRequest::new(
        ["parity"],
        vec![
            MeasureAggregator::new("value", AggFunction::Sum),
            MeasureAggregator::new("value", AggFunction::Min),
            MeasureAggregator::new("value", AggFunction::Avg),
            MeasureAggregator::count_all(),
        ],
    );
    let mut r = open(&key);
    assert!(r.can_use_agile_tree(&req).unwrap());
    let mut out = GroupByBuckets::new(&req);
    r.apply_group_by_jit(&req, &mut out).unwrap();

    let even: i64 = (0..n).filter(|i| i % 2 == 0).sum();
    let odd: i64 = (0..n).filter(|i| i % 2 == 1).sum();
    let rows = out.into_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].key, vec!["even".to_string()]);
    assert_eq!(rows[0].values[0], Some(NumericValue::Int(even)));
    assert_eq!(rows[0].values[1], Some(NumericValue::Int(0)));
    assert_eq!(rows[0].values[2], Some(NumericValue::Float(even as f64 / 500.0)));
    assert_eq!(rows[0].values[3], Some(NumericValue::Int(500)));
    assert_eq!(rows[1].key, vec!["odd".to_string()]);
    assert_eq!(rows[1].values[0], Some(NumericValue::Int(odd)));
    assert_eq!(rows[1].values[1], Some(NumericValue::Int(1)));
}

#[test]
fn float_measures_and_missing_values() {
    let dir = tempdir().unwrap();
    let key = seg_key(&dir, "seg");
    let mut w = AgileTreeWriter::new(["host"], ["cpu"]);
    w.add_row(&[b"a"], &[Some(NumericValue::Float(0.25))]).unwrap();
    w.add_row(&[b"a"], &[Some(NumericValue::Int(1))]).unwrap();
    w.add_row(&[b"b"], &[None]).unwrap();
    w.write(&key).unwrap();

    let req = GroupByRequest::new(
        ["host"],
        vec![
            MeasureAggregator::new("cpu", AggFunction::Sum),
            MeasureAggregator::new("cpu", AggFunction::Max),
        ],
    );
    let mut r = open(&key);
    let mut out = GroupByBuckets::new(&req);
    r.apply_group_by_jit(&req, &mut out).unwrap();
    let a = out.get(&["a".to_string()]).unwrap();
    assert_eq!(a.measures, vec![Accumulator::Float(1.25), Accumulator::Float(1.0)]);
    let b = out.get(&["b".to_string()]).unwrap();
    assert_eq!(b.count, 1);
    assert_eq!(b.measures, vec![Accumulator::Empty, Accumulator::Empty]);
}

/// Builds a tree over `host` only with one row per listed host.
fn host_tree(key: &str, hosts: &[&str]) {
    let mut w = AgileTreeWriter::new(["host"], ["v"]);
    for h in hosts {
        w.add_row(&[h.as_bytes()], &[Some(NumericValue::Int(1))]).unwrap();
    }
    w.write(key).unwrap();
}

#[test]
fn bucket_limit_is_stable_across_segments() {
    let dir = tempdir().unwrap();
    let (k1, k2) = (seg_key(&dir, "s1"), seg_key(&dir, "s2"));
    host_tree(&k1, &["h1", "h2", "h3", "h4"]);
    host_tree(&k2, &["h5", "h3", "h6", "h1", "h2", "h4"]);

    let req = GroupByRequest::new(["host"], vec![MeasureAggregator::new("v", AggFunction::Sum)])
        .with_bucket_limit(3);
    let listener = Arc::new(RecordingListener::default());

    let mut first = GroupByBuckets::new(&req);
    let mut r1 = AgileTreeReader::open(k1.as_str(), Arc::new(BufferPools::default()), listener.clone())
        .unwrap();
    r1.apply_group_by_jit(&req, &mut first).unwrap();
    let after_first: HashSet<BucketKey> = first.get_buckets();
    assert_eq!(after_first.len(), 3);
    assert_eq!(first.len(), 3);

    let mut second = GroupByBuckets::new(&req);
    second.set_buckets(first.get_buckets());
    let mut r2 = open(&k2);
    r2.apply_group_by_jit(&req, &mut second).unwrap();

    let second_keys: HashSet<BucketKey> = second.into_rows().into_iter().map(|r| r.key).collect();
    assert!(second_keys.len() <= 3);
    for k in &second_keys {
        assert!(after_first.contains(k), "{:?} was not admitted by the first segment", k);
    }
    // Segment two holds every admitted host, so none may be dropped.
    for k in &after_first {
        assert!(second_keys.contains(k));
    }
    first.merge(GroupByBuckets::new(&req));
    assert!(first.len() <= 3);

    let events = listener.events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, ReaderEvent::AgileTreeBucketLimitReached { limit: 3, .. })));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_limit_never_exceeded_and_keys_never_dropped(
        seg_a in prop::collection::vec(0u8..12, 1..60),
        seg_b in prop::collection::vec(0u8..12, 1..60),
        limit in 1usize..6,
    ) {
        let dir = tempdir().unwrap();
        let (ka, kb) = (seg_key(&dir, "a"), seg_key(&dir, "b"));
        let names = |v: &[u8]| v.iter().map(|h| format!("h{}", h)).collect::<Vec<_>>();
        let (na, nb) = (names(&seg_a), names(&seg_b));
        host_tree(&ka, &na.iter().map(String::as_str).collect::<Vec<_>>());
        host_tree(&kb, &nb.iter().map(String::as_str).collect::<Vec<_>>());

        let req = GroupByRequest::new(["host"], vec![MeasureAggregator::count_all()])
            .with_bucket_limit(limit);
        let mut first = GroupByBuckets::new(&req);
        open(&ka).apply_group_by_jit(&req, &mut first).unwrap();
        let admitted = first.get_buckets();
        let first_keys: HashSet<BucketKey> = first.clone().into_rows().into_iter().map(|r| r.key).collect();

        let mut second = GroupByBuckets::new(&req);
        second.set_buckets(admitted.clone());
        open(&kb).apply_group_by_jit(&req, &mut second).unwrap();
        let second_seen = second.get_buckets();

        prop_assert!(second_seen.len() <= limit);
        prop_assert!(admitted.is_subset(&second_seen));
        for k in &first_keys {
            prop_assert!(second_seen.contains(k));
        }

        first.merge(second);
        prop_assert!(first.len() <= limit);
    }
}
