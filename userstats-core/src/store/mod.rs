//! Persistent storage for contributor counters.
//!
//! The [`CounterStore`] trait is the only shared mutable resource of an
//! ingestion run. Implementations must make [`CounterStore::update`] an
//! atomic read-modify-write per contributor so that channel workers feeding
//! the same contributor never lose increments.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::counters::{ContributorCounters, CounterRecordError};
use crate::model::ContributorId;

mod locks;
#[cfg(feature = "store-sqlite")]
mod sqlite;

pub(crate) use locks::KeyLocks;
#[cfg(feature = "store-sqlite")]
pub use sqlite::{COUNTER_STORE_FILE_NAME, SCHEMA_VERSION, SqliteCounterStore};

/// Default number of lock stripes.
pub const DEFAULT_LOCK_STRIPES: usize = 256;

/// Default bound on waiting for a contributor lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables shared by store implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Number of per-contributor lock stripes.
    pub lock_stripes: usize,
    /// Longest wait for a contributor lock before reporting contention.
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_stripes: DEFAULT_LOCK_STRIPES,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Errors raised by counter stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store location cannot host a store.
    #[error("counter store at {path:?} is unavailable: {reason}")]
    Unavailable {
        /// Requested store location.
        path: PathBuf,
        /// Why the location was rejected.
        reason: &'static str,
    },
    /// Removing a previous store at the location failed.
    #[error("failed to remove previous counter store at {path:?}")]
    RemoveStale {
        /// File that could not be removed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// SQLite could not open or initialise the database.
    #[cfg(feature = "store-sqlite")]
    #[error("failed to open counter store at {path:?}")]
    OpenDatabase {
        /// Database path.
        path: PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// An existing store was written by an incompatible schema.
    #[error("expected counter store schema version {expected} but found {found:?}")]
    SchemaVersion {
        /// Version this build writes.
        expected: i64,
        /// Version recorded in the store, if any.
        found: Option<i64>,
    },
    /// The store was used after [`CounterStore::close`].
    #[error("counter store is closed")]
    Closed,
    /// A contributor lock could not be acquired in time.
    #[error("timed out after {timeout:?} waiting for the record of contributor {contributor}")]
    ContentionTimeout {
        /// Contributor whose record was contended.
        contributor: ContributorId,
        /// Configured wait bound.
        timeout: Duration,
    },
    /// A stored record failed validation.
    #[error("stored record for contributor {contributor} is invalid")]
    InvalidRecord {
        /// Contributor owning the record.
        contributor: ContributorId,
        /// Validation failure.
        #[source]
        source: CounterRecordError,
    },
    /// A count or timestamp does not fit the storage representation.
    #[error("{field} of contributor {contributor} is out of the storable range")]
    OutOfRange {
        /// Contributor owning the record.
        contributor: ContributorId,
        /// Offending column.
        field: &'static str,
    },
    /// A database statement failed.
    #[cfg(feature = "store-sqlite")]
    #[error("counter store failed to {operation}")]
    Database {
        /// What the store was doing.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
}

impl StoreError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::ContentionTimeout { .. })
    }
}

/// Mapping from contributor identity to counters.
///
/// All methods take `&self` so one store can be shared by the channel
/// workers of an ingestion run.
pub trait CounterStore: Send + Sync {
    /// Fetch the record for `contributor`, if one exists.
    fn get(&self, contributor: ContributorId) -> Result<Option<ContributorCounters>, StoreError>;

    /// Replace the record for `contributor`.
    fn upsert(
        &self,
        contributor: ContributorId,
        record: &ContributorCounters,
    ) -> Result<(), StoreError>;

    /// Atomically read, transform and write back the record for
    /// `contributor`. `apply` receives `None` when no record exists yet.
    fn update<F>(&self, contributor: ContributorId, apply: F) -> Result<ContributorCounters, StoreError>
    where
        F: FnOnce(Option<ContributorCounters>) -> ContributorCounters;

    /// Snapshot every record, ordered by contributor id.
    fn iterate(
        &self,
    ) -> Result<Box<dyn Iterator<Item = (ContributorId, ContributorCounters)> + Send + '_>, StoreError>;

    /// Number of distinct contributors.
    fn count(&self) -> Result<u64, StoreError>;

    /// Flush pending writes and release resources. Later calls to other
    /// methods fail with [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

impl<S: CounterStore> CounterStore for std::sync::Arc<S> {
    fn get(&self, contributor: ContributorId) -> Result<Option<ContributorCounters>, StoreError> {
        self.as_ref().get(contributor)
    }

    fn upsert(
        &self,
        contributor: ContributorId,
        record: &ContributorCounters,
    ) -> Result<(), StoreError> {
        self.as_ref().upsert(contributor, record)
    }

    fn update<F>(&self, contributor: ContributorId, apply: F) -> Result<ContributorCounters, StoreError>
    where
        F: FnOnce(Option<ContributorCounters>) -> ContributorCounters,
    {
        self.as_ref().update(contributor, apply)
    }

    fn iterate(
        &self,
    ) -> Result<Box<dyn Iterator<Item = (ContributorId, ContributorCounters)> + Send + '_>, StoreError>
    {
        self.as_ref().iterate()
    }

    fn count(&self) -> Result<u64, StoreError> {
        self.as_ref().count()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.as_ref().close()
    }
}
