//! Test-only, in-memory `CounterStore` implementation used by unit and
//! behaviour tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::counters::ContributorCounters;
use crate::model::ContributorId;
use crate::store::{CounterStore, StoreError};

/// In-memory `CounterStore` keyed by contributor id.
///
/// A single mutex guards the whole map, so every update is trivially atomic.
/// [`MemoryCounterStore::fail_next_updates`] injects contention failures.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    records: Mutex<BTreeMap<ContributorId, ContributorCounters>>,
    closed: AtomicBool,
    pending_contention: AtomicU32,
}

impl MemoryCounterStore {
    /// Create a store pre-populated with `records`.
    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = (ContributorId, ContributorCounters)>,
    {
        Self {
            records: Mutex::new(records.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Make the next `count` calls to [`CounterStore::update`] fail with
    /// [`StoreError::ContentionTimeout`].
    pub fn fail_next_updates(&self, count: u32) {
        self.pending_contention.store(count, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn take_contention(&self, contributor: ContributorId) -> Result<(), StoreError> {
        let injected = self
            .pending_contention
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                pending.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(StoreError::ContentionTimeout {
                contributor,
                timeout: Duration::ZERO,
            });
        }
        Ok(())
    }
}

impl CounterStore for MemoryCounterStore {
    fn get(&self, contributor: ContributorId) -> Result<Option<ContributorCounters>, StoreError> {
        self.ensure_open()?;
        Ok(self.records.lock().get(&contributor).cloned())
    }

    fn upsert(
        &self,
        contributor: ContributorId,
        record: &ContributorCounters,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.records.lock().insert(contributor, record.clone());
        Ok(())
    }

    fn update<F>(&self, contributor: ContributorId, apply: F) -> Result<ContributorCounters, StoreError>
    where
        F: FnOnce(Option<ContributorCounters>) -> ContributorCounters,
    {
        self.ensure_open()?;
        self.take_contention(contributor)?;
        let mut records = self.records.lock();
        let next = apply(records.remove(&contributor));
        records.insert(contributor, next.clone());
        Ok(next)
    }

    fn iterate(
        &self,
    ) -> Result<Box<dyn Iterator<Item = (ContributorId, ContributorCounters)> + Send + '_>, StoreError>
    {
        self.ensure_open()?;
        let snapshot: Vec<_> = self
            .records
            .lock()
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        Ok(Box::new(snapshot.into_iter()))
    }

    fn count(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        Ok(u64::try_from(self.records.lock().len()).unwrap_or(u64::MAX))
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
