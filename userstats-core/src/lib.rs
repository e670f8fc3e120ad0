//! Streaming aggregation of OSM history into per-contributor counters.
//!
//! The crate holds the engine shared by every front end:
//! - [`RunDetector`] turns one channel's ordered revisions into exactly one
//!   [`CompletionEvent`] per feature.
//! - [`Aggregator`] attributes each completed feature to its owner and its
//!   creator.
//! - [`CounterStore`] persists the resulting [`ContributorCounters`], with
//!   [`SqliteCounterStore`] as the durable implementation.
//!
//! Archive decoding and export live in `userstats-data`.

#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod aggregator;
mod counters;
mod detector;
mod model;
mod store;

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod test_support;

pub use aggregator::{Aggregator, RetryPolicy};
pub use counters::{ContributorCounters, CounterRecordError, KindCounters};
pub use detector::{FeatureRunState, RunDetector, RunDetectorError};
pub use model::{
    CompletionEvent, ContributorId, FeatureKind, PerChannel, RevisionPayload, RevisionTuple,
    Timestamp,
};
pub use store::{
    CounterStore, DEFAULT_LOCK_STRIPES, DEFAULT_LOCK_TIMEOUT, StoreError, StoreOptions,
};
#[cfg(feature = "store-sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "store-sqlite")))]
pub use store::{COUNTER_STORE_FILE_NAME, SCHEMA_VERSION, SqliteCounterStore};
