//! Reads a small encoded history archive end to end.
//!
//! The fixture holds a header block, an unknown block type and three data
//! blocks:
//!
//! - node 1: tagged by contributor 10, then untagged and deleted by 20
//! - node 2: created by 10 as a plain node, edited by 30 in a dense block
//! - node 3: created by 30 in a dense block
//! - way 10: created by 10, edited by 20
//! - relation 20: created by 30

use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use rstest::{fixture, rstest};
use tempfile::TempDir;
use userstats_core::test_support::MemoryCounterStore;
use userstats_core::{Aggregator, ContributorCounters, ContributorId, CounterStore, FeatureKind};
use userstats_data::{
    DriverMode, DriverOptions, PbfHistorySource, RevisionBatch, RevisionSource, StreamDriver,
};

mod support;

use support::decode_fixture;

const BASE_SECONDS: i64 = 1_300_000_000;

fn at(offset: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(BASE_SECONDS + offset, 0).expect("timestamp in range")
}

#[fixture]
fn archive() -> (TempDir, PbfHistorySource) {
    let dir = TempDir::new().expect("create temp dir");
    let path = decode_fixture(dir.path(), "history");
    (dir, PbfHistorySource::new(path))
}

fn read_all(source: PbfHistorySource) -> Vec<RevisionBatch> {
    let mut batches = Vec::new();
    source
        .read_batches(&mut |batch| {
            batches.push(batch);
            ControlFlow::Continue(())
        })
        .expect("fixture decodes");
    batches
}

fn channel(batches: &[RevisionBatch], kind: FeatureKind) -> Vec<(i64, u32, i64)> {
    batches
        .iter()
        .filter(|batch| batch.kind == kind)
        .flat_map(|batch| &batch.tuples)
        .map(|tuple| {
            assert_eq!(tuple.kind, kind, "tuple kind matches its batch");
            (tuple.feature_id, tuple.version, tuple.contributor.get())
        })
        .collect()
}

fn counters(store: &MemoryCounterStore, id: i64) -> ContributorCounters {
    store
        .get(ContributorId::new(id))
        .expect("read")
        .expect("record exists")
}

#[rstest]
fn revisions_are_routed_by_whole_node_history(archive: (TempDir, PbfHistorySource)) {
    let (_dir, source) = archive;
    let batches = read_all(source);

    let kinds: Vec<FeatureKind> = batches.iter().map(|batch| batch.kind).collect();
    assert_eq!(
        kinds,
        vec![
            FeatureKind::Node,
            FeatureKind::Point,
            FeatureKind::Point,
            FeatureKind::Way,
            FeatureKind::Relation,
        ]
    );
    assert_eq!(
        channel(&batches, FeatureKind::Node),
        vec![(1, 1, 10), (1, 2, 20)]
    );
    assert_eq!(
        channel(&batches, FeatureKind::Point),
        vec![(2, 1, 10), (2, 2, 30), (3, 1, 30)]
    );
    assert_eq!(
        channel(&batches, FeatureKind::Way),
        vec![(10, 1, 10), (10, 2, 20)]
    );
    assert_eq!(channel(&batches, FeatureKind::Relation), vec![(20, 1, 30)]);
}

#[rstest]
fn revision_metadata_survives_decoding(archive: (TempDir, PbfHistorySource)) {
    let (_dir, source) = archive;
    let batches = read_all(source);
    let tuples: Vec<_> = batches.iter().flat_map(|batch| &batch.tuples).collect();

    let deleted = tuples
        .iter()
        .find(|tuple| tuple.kind == FeatureKind::Node && tuple.version == 2)
        .expect("second revision of node 1");
    assert_eq!(deleted.timestamp, at(600));
    assert_eq!(deleted.payload.changeset, 101);
    assert_eq!(deleted.payload.contributor_name.as_deref(), Some("bob"));

    let dense = tuples
        .iter()
        .find(|tuple| tuple.kind == FeatureKind::Point && tuple.feature_id == 3)
        .expect("dense node 3");
    assert_eq!(dense.timestamp, at(3000));
    assert_eq!(dense.payload.changeset, 104);
    assert_eq!(dense.payload.contributor_name.as_deref(), Some("carol"));
}

#[rstest]
fn stopping_after_the_first_batch_ends_the_read(archive: (TempDir, PbfHistorySource)) {
    let (_dir, source) = archive;
    let mut seen = Vec::new();
    source
        .read_batches(&mut |batch| {
            seen.push(batch.kind);
            ControlFlow::Break(())
        })
        .expect("early stop is not an error");
    assert_eq!(seen, vec![FeatureKind::Node]);
}

#[rstest]
#[case(DriverMode::Sequential)]
#[case(DriverMode::Concurrent)]
fn archive_aggregates_into_counters(
    archive: (TempDir, PbfHistorySource),
    #[case] mode: DriverMode,
) {
    let (_dir, source) = archive;
    let driver = StreamDriver::new(
        Aggregator::new(MemoryCounterStore::default()),
        DriverOptions {
            mode,
            ..DriverOptions::default()
        },
    );
    let report = driver.run(source).expect("ingest fixture");

    assert_eq!(report.tuples(), 8);
    assert_eq!(report.features(), 5);
    assert_eq!(report.contributors, 3);
    assert_eq!(report.channels.get(FeatureKind::Node).features, 1);
    assert_eq!(report.channels.get(FeatureKind::Point).features, 2);

    let store = driver.into_aggregator().into_store();
    let alice = counters(&store, 10);
    assert_eq!(
        (alice.node.created, alice.point.created, alice.way.created),
        (1, 1, 1)
    );
    assert_eq!(alice.total_features(), 0);
    assert_eq!(alice.first_activity(), at(0));
    assert_eq!(alice.last_activity(), at(4000));
    assert_eq!(alice.display_name(), Some("alice"));

    let bob = counters(&store, 20);
    assert_eq!((bob.node.total, bob.node.currently_owned), (1, 1));
    assert_eq!((bob.way.total, bob.way.created), (1, 0));
    assert_eq!(bob.first_activity(), at(600));
    assert_eq!(bob.last_activity(), at(5000));

    let carol = counters(&store, 30);
    assert_eq!(
        (carol.point.total, carol.point.created, carol.point.currently_owned),
        (2, 1, 2)
    );
    assert_eq!((carol.relation.total, carol.relation.created), (1, 1));
    assert_eq!(carol.first_activity(), at(2000));
    assert_eq!(carol.last_activity(), at(6000));
}
