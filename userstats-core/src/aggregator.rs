//! Apply completion events to a counter store.

use std::{thread, time::Duration};

use log::{debug, warn};

use crate::counters::ContributorCounters;
use crate::model::{CompletionEvent, ContributorId, Timestamp};
use crate::store::{CounterStore, StoreError};

/// Bounded retry of contended store updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per update, including the first.
    pub max_attempts: u32,
    /// Pause before the second attempt; doubled for every later attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Policy that gives up after the first contention.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Turns completion events into counter increments.
///
/// The owner of a feature (author of its most recent revision) earns
/// `total` and `currently_owned`; the author of its first-seen revision earns
/// `created`. When both are the same contributor a single update carries all
/// three increments.
///
/// # Examples
/// ```
/// use chrono::{TimeZone, Utc};
/// use userstats_core::{
///     Aggregator, CompletionEvent, ContributorId, CounterStore, FeatureKind,
///     SqliteCounterStore,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempfile::tempdir()?;
/// let at = Utc.with_ymd_and_hms(2015, 7, 1, 0, 0, 0).unwrap();
/// let aggregator = Aggregator::new(SqliteCounterStore::open_in_dir(dir.path())?);
/// aggregator.apply(&CompletionEvent {
///     feature_id: 1,
///     kind: FeatureKind::Node,
///     contributor: ContributorId::new(5),
///     creator: ContributorId::new(5),
///     first_version_timestamp: at,
///     last_version_timestamp: at,
///     first_version: 1,
///     last_version: 1,
///     revision_count: 1,
///     contributor_name: None,
///     creator_name: None,
/// })?;
/// let record = aggregator.store().get(ContributorId::new(5))?.unwrap();
/// assert_eq!(record.node.total, 1);
/// assert_eq!(record.node.created, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Aggregator<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: CounterStore> Aggregator<S> {
    /// Aggregate into `store` with the default [`RetryPolicy`].
    pub fn new(store: S) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    /// Aggregate into `store` with an explicit retry policy.
    pub fn with_retry(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Borrow the underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Release the underlying store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Record one completed feature.
    ///
    /// On failure, updates already committed for this event remain.
    pub fn apply(&self, event: &CompletionEvent) -> Result<(), StoreError> {
        let created_by_owner = event.created_by_owner();
        let kind = event.kind;
        self.update_with_retry(event.contributor, event.last_version_timestamp, |record| {
            // Names from revisions older than the record's activity are stale.
            let newest = event.last_version_timestamp >= record.last_activity();
            let counts = record.kind_mut(kind);
            counts.total += 1;
            counts.currently_owned += 1;
            if created_by_owner {
                counts.created += 1;
                record.record_activity(event.first_version_timestamp);
            }
            record.record_activity(event.last_version_timestamp);
            if newest {
                record.set_display_name(event.contributor_name.as_deref());
            }
        })?;

        if !created_by_owner {
            self.update_with_retry(event.creator, event.first_version_timestamp, |record| {
                let newest = event.first_version_timestamp >= record.last_activity();
                record.kind_mut(kind).created += 1;
                record.record_activity(event.first_version_timestamp);
                if newest {
                    record.set_display_name(event.creator_name.as_deref());
                }
            })?;
        }
        Ok(())
    }

    fn update_with_retry(
        &self,
        contributor: ContributorId,
        at: Timestamp,
        change: impl Fn(&mut ContributorCounters),
    ) -> Result<(), StoreError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.store.update(contributor, |current| {
                let mut record = current.unwrap_or_else(|| {
                    debug!("first activity for contributor {contributor} at {at}");
                    ContributorCounters::new(at)
                });
                change(&mut record);
                record
            });
            match result {
                Ok(_) => return Ok(()),
                Err(err) if err.is_contention() && attempt < attempts => {
                    let pause = self.retry.backoff(attempt);
                    warn!(
                        "retrying update of contributor {contributor} in {pause:?} \
                         (attempt {attempt} of {attempts}): {err}"
                    );
                    thread::sleep(pause);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
