//! Facade crate for OSM contributor statistics.
//!
//! This crate re-exports the aggregation engine and exposes the durable store,
//! the PBF history reader and the exporter behind feature flags.

#![forbid(unsafe_code)]

pub use userstats_core::{
    Aggregator, CompletionEvent, ContributorCounters, ContributorId, CounterStore, FeatureKind,
    KindCounters, PerChannel, RetryPolicy, RevisionTuple, RunDetector, RunDetectorError,
    StoreError, StoreOptions, Timestamp,
};

#[cfg(feature = "store-sqlite")]
pub use userstats_core::SqliteCounterStore;

#[cfg(feature = "test-support")]
pub use userstats_core::test_support;

#[cfg(feature = "pbf")]
pub use userstats_data::{
    Delimiter, ExportError, ExportLayout, ExportOptions, IngestError, IngestReport,
    PbfHistorySource, RevisionSource, StreamDriver, export_to_dir,
};
