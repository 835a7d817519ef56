//! End-to-end detection against the in-memory store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use summit_engine::{
    Activity, BacklogScheduler, DetectionConfig, DetectionOutcome, DistanceMetric, MemoryStore,
    Summit, SummitDetector, SummitError,
};

const REFERENCE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

/// On the first segment of the reference track.
const NEAR_PEAK: (f64, f64) = (39.6, -120.575);
/// ~10 km east of the near peak, inside the track's bounding box.
const FAR_PEAK: (f64, f64) = (39.6, -120.455);
/// North of the buffered bounding box.
const OUTSIDE_PEAK: (f64, f64) = (44.0, -121.0);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn catalog() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_summit(Summit::new(1, "Near Peak", NEAR_PEAK.0, NEAR_PEAK.1));
    store.add_summit(Summit::new(2, "Far Peak", FAR_PEAK.0, FAR_PEAK.1));
    store
}

fn detector(store: &Arc<MemoryStore>, config: DetectionConfig) -> SummitDetector {
    SummitDetector::new(store.clone(), store.clone(), store.clone(), config).unwrap()
}

fn hike(id: i64, user_id: i64, polyline: &str) -> Activity {
    Activity::new(
        id,
        user_id,
        polyline,
        Utc.with_ymd_and_hms(2024, 9, 14, 7, 0, 0).unwrap(),
    )
}

#[test]
fn reference_track_reaches_only_the_near_summit() {
    init_logging();
    let store = catalog();
    store.add_activity(hike(100, 1, REFERENCE));

    let mut activity = store.activity(100).unwrap();
    let outcome = detector(&store, DetectionConfig::default())
        .detect_summits(&mut activity)
        .unwrap();

    assert_eq!(
        outcome,
        DetectionOutcome::Completed {
            summit_ids: vec![1],
            candidates: 2,
        }
    );

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].summit_id, 1);
    assert_eq!(records[0].user_id, 1);
    assert_eq!(records[0].activity_id, 100);

    let saved = store.activity(100).unwrap();
    assert!(saved.has_summit);
    assert!(saved.processed);
}

#[test]
fn meter_threshold_gives_the_same_result() {
    let store = catalog();
    store.add_activity(hike(100, 1, REFERENCE));

    let config = DetectionConfig {
        summit_threshold: 70.0,
        distance_metric: DistanceMetric::Equirectangular,
        ..DetectionConfig::default()
    };
    let mut activity = store.activity(100).unwrap();
    let outcome = detector(&store, config).detect_summits(&mut activity).unwrap();

    assert_eq!(outcome.summit_count(), 1);
    assert_eq!(store.records()[0].summit_id, 1);
}

#[test]
fn rerunning_detection_does_not_duplicate_records() {
    let store = catalog();
    store.add_activity(hike(100, 1, REFERENCE));
    let detector = detector(&store, DetectionConfig::default());

    for _ in 0..2 {
        let mut activity = store.activity(100).unwrap();
        detector.detect_summits(&mut activity).unwrap();
    }
    assert_eq!(store.record_count(), 1);

    // Reset then sweep again: still a single record per key
    store.reset_detection().unwrap();
    BacklogScheduler::new(detector.clone())
        .run_backlog_sweep()
        .unwrap();
    BacklogScheduler::new(detector).run_single_activity(100).unwrap();
    assert_eq!(store.record_count(), 1);
}

#[test]
fn same_summit_on_different_activities_and_users() {
    let store = catalog();
    store.add_activity(hike(100, 1, REFERENCE));
    store.add_activity(hike(101, 1, REFERENCE));
    store.add_activity(hike(200, 2, REFERENCE));

    let summary = BacklogScheduler::new(detector(&store, DetectionConfig::default()))
        .run_backlog_sweep()
        .unwrap();

    assert_eq!(summary.with_summit, 3);
    let keys: Vec<_> = store.records().iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec![(1, 1, 100), (1, 1, 101), (2, 1, 200)]);
}

#[test]
fn empty_polyline_is_skipped_without_records() {
    let store = catalog();
    store.add_activity(hike(100, 1, ""));

    let mut activity = store.activity(100).unwrap();
    let outcome = detector(&store, DetectionConfig::default())
        .detect_summits(&mut activity)
        .unwrap();

    assert_eq!(outcome, DetectionOutcome::NoRoute);
    let saved = store.activity(100).unwrap();
    assert!(saved.processed);
    assert!(!saved.has_summit);
    assert_eq!(store.record_count(), 0);
    assert_eq!(store.catalog_queries(), 0);
}

#[test]
fn malformed_polyline_is_marked_processed() {
    init_logging();
    let store = catalog();
    let truncated = &REFERENCE[..REFERENCE.len() - 1];
    store.add_activity(hike(100, 1, truncated));

    let mut activity = store.activity(100).unwrap();
    let outcome = detector(&store, DetectionConfig::default())
        .detect_summits(&mut activity)
        .unwrap();

    assert!(matches!(outcome, DetectionOutcome::DecodeError { .. }));
    assert!(store.activity(100).unwrap().processed);
    assert_eq!(store.record_count(), 0);
}

#[test]
fn summits_outside_the_buffered_box_never_reach_the_evaluator() {
    let store = catalog();
    store.add_summit(Summit::new(3, "Outside Peak", OUTSIDE_PEAK.0, OUTSIDE_PEAK.1));
    store.add_activity(hike(100, 1, REFERENCE));

    let mut activity = store.activity(100).unwrap();
    let outcome = detector(&store, DetectionConfig::default())
        .detect_summits(&mut activity)
        .unwrap();

    match outcome {
        DetectionOutcome::Completed { candidates, summit_ids } => {
            assert_eq!(candidates, 2);
            assert!(!summit_ids.contains(&3));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(store.catalog_queries(), 1);
}

#[test]
fn lookup_failures_are_retried_when_enabled() {
    init_logging();
    let store = catalog();
    store.add_activity(hike(100, 1, REFERENCE));
    let scheduler = BacklogScheduler::new(detector(
        &store,
        DetectionConfig {
            retry_lookup_failures: true,
            ..DetectionConfig::default()
        },
    ));

    store.set_catalog_available(false);
    let summary = scheduler.run_backlog_sweep().unwrap();
    assert_eq!(summary.lookup_errors, 1);
    assert!(!store.activity(100).unwrap().processed);

    store.set_catalog_available(true);
    let summary = scheduler.run_backlog_sweep().unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.with_summit, 1);
    assert!(store.activity(100).unwrap().processed);
}

#[test]
fn lookup_failures_are_final_by_default() {
    let store = catalog();
    store.add_activity(hike(100, 1, REFERENCE));
    let scheduler = BacklogScheduler::new(detector(&store, DetectionConfig::default()));

    store.set_catalog_available(false);
    assert_eq!(scheduler.run_backlog_sweep().unwrap().lookup_errors, 1);

    store.set_catalog_available(true);
    assert_eq!(scheduler.run_backlog_sweep().unwrap().total, 0);
    assert_eq!(store.record_count(), 0);
}

#[test]
fn failed_record_upsert_still_counts_the_summit() {
    init_logging();
    let store = catalog();
    store.add_activity(hike(100, 1, REFERENCE));
    store.set_records_available(false);

    let mut activity = store.activity(100).unwrap();
    let outcome = detector(&store, DetectionConfig::default())
        .detect_summits(&mut activity)
        .unwrap();

    assert_eq!(outcome.summit_count(), 1);
    assert_eq!(store.record_count(), 0);
    let saved = store.activity(100).unwrap();
    assert!(saved.has_summit);
    assert!(saved.processed);
}

#[test]
fn failed_flag_save_is_counted_and_the_sweep_continues() {
    init_logging();
    let store = catalog();
    for id in 1..=3 {
        store.add_activity(hike(id, 1, REFERENCE));
    }
    store.fail_saves_for(2);

    let scheduler = BacklogScheduler::new(detector(&store, DetectionConfig::default()));
    let summary = scheduler.run_backlog_sweep().unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert!(store.activity(1).unwrap().processed);
    assert!(!store.activity(2).unwrap().processed);
    assert!(store.activity(3).unwrap().processed);

    let result = scheduler.run_single_activity(2);
    assert!(matches!(result, Err(SummitError::Storage { .. })));
}

#[test]
fn detection_never_creates_unknown_activities() {
    let store = catalog();
    let mut stray = hike(77, 1, "");

    let result = detector(&store, DetectionConfig::default()).detect_summits(&mut stray);

    assert!(matches!(result, Err(SummitError::ActivityNotFound(77))));
    assert!(store.activity(77).is_none());
}
