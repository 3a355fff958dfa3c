use cohortstore::{
    CancelToken, FeatureRecord, FeatureStore, IndexManager, QueryFilter, RebuildOutcome,
    StoreConfig,
};
use tempfile::tempdir;
use time::macros::date;
use time::Date;

fn open_store(root: &std::path::Path) -> FeatureStore {
    FeatureStore::open(StoreConfig::new(root)).expect("store open")
}

fn populate(store: &FeatureStore) {
    let mut records = Vec::new();
    for patient in 0..10u8 {
        for month in [1u8, 4, 9] {
            let day = Date::from_calendar_date(2024, time::Month::try_from(month).unwrap(), 5)
                .unwrap();
            let cohort = if patient % 2 == 0 { "adni" } else { "ukbb" };
            records.push(
                FeatureRecord::new(format!("P{:03}", patient), day, cohort)
                    .with_feature("mmse_score", patient as f64),
            );
        }
    }
    // Several batches, interleaved order, plus one overwrite.
    for chunk in records.chunks(7) {
        store.write(chunk.to_vec(), None).expect("write chunk");
    }
    store
        .write(
            vec![FeatureRecord::new("P000", date!(2024 - 01 - 05), "adni")
                .with_feature("mmse_score", 99.0)],
            None,
        )
        .expect("overwrite");
}

/// The entries of every index file produced by incremental maintenance are
/// identical to a wholesale rebuild over the same partitions.
#[test]
fn incremental_equals_rebuild() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    populate(&store);
    store.flush().expect("flush");

    // Rebuild into a separate index root from the same partitions.
    let rebuilt_root = dir.path().join("rebuilt_index");
    let rebuilt = IndexManager::open(&rebuilt_root).expect("open rebuilt");
    let outcome = rebuilt
        .rebuild(&dir.path().join("partitions"), &CancelToken::new())
        .expect("rebuild");
    assert!(matches!(outcome, RebuildOutcome::Rebuilt { partitions: 6 }));

    for name in ["patient.idx.json", "date.idx.json", "cohort.idx.json"] {
        let incremental: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("index").join(name)).expect("read"),
        )
        .expect("parse");
        let rebuilt: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(rebuilt_root.join(name)).expect("read"),
        )
        .expect("parse");
        assert_eq!(
            incremental["entries"], rebuilt["entries"],
            "{} diverged between incremental maintenance and rebuild",
            name
        );
    }
}

/// Rebuilding in place replaces the maintained index and queries still work.
#[test]
fn rebuild_in_place_preserves_queries() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    populate(&store);

    let before = store.query(&QueryFilter::new()).expect("query before");
    let outcome = store.rebuild_index(&CancelToken::new()).expect("rebuild");
    assert!(matches!(outcome, RebuildOutcome::Rebuilt { .. }));

    let after = store.query(&QueryFilter::new()).expect("query after");
    assert_eq!(before, after);
    store.verify_index().expect("verify");
}

/// Indexes survive a close/reopen cycle.
#[test]
fn index_persists_across_reopen() {
    let dir = tempdir().expect("tempdir");
    {
        let store = open_store(dir.path());
        populate(&store);
    }
    let reopened = open_store(dir.path());
    let records = reopened
        .query(&QueryFilter::new().patients(["P003"]))
        .expect("query");
    assert_eq!(records.len(), 3);
    reopened.verify_index().expect("verify");

    let stats = reopened.index_stats();
    assert_eq!(stats.patients, 10);
    assert_eq!(stats.partitions, 6);
    assert_eq!(stats.cohorts, 2);
}

/// A partition removed behind the store's back is reported as an
/// inconsistency, not silently served, and a rebuild repairs it.
#[test]
fn verify_detects_vanished_partition_and_rebuild_repairs() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    populate(&store);

    let victim = dir
        .path()
        .join("partitions/cohort=adni/year=2024/month=01");
    std::fs::remove_dir_all(&victim).expect("remove partition");

    assert!(store.verify_index().is_err());
    let outcome = store.rebuild_index(&CancelToken::new()).expect("rebuild");
    assert!(matches!(outcome, RebuildOutcome::Rebuilt { partitions: 5 }));
    store.verify_index().expect("verify after rebuild");
}

/// A cancelled rebuild changes nothing.
#[test]
fn cancelled_rebuild_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    populate(&store);

    let generation_before = store.index_stats().generation;
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(store.rebuild_index(&cancel).is_err());
    assert_eq!(store.index_stats().generation, generation_before);
    store.verify_index().expect("still consistent");
}
