//! Striped per-contributor locks for read-modify-write updates.
//!
//! Contributor ids hash onto a fixed set of stripes. Updates to the same
//! contributor always contend on the same stripe; updates to contributors on
//! different stripes proceed independently. Acquisition is bounded by a
//! timeout so that a stuck writer surfaces as
//! [`StoreError::ContentionTimeout`] instead of blocking forever.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::StoreError;
use crate::model::ContributorId;

/// Fixed table of stripe locks.
#[derive(Debug)]
pub(crate) struct KeyLocks {
    stripes: Vec<Mutex<()>>,
    timeout: Duration,
}

impl KeyLocks {
    /// Build a table with `stripes` locks (at least one).
    pub(crate) fn new(stripes: usize, timeout: Duration) -> Self {
        let count = stripes.max(1);
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
            timeout,
        }
    }

    fn stripe_index(&self, contributor: ContributorId) -> usize {
        let len = u64::try_from(self.stripes.len()).unwrap_or(u64::MAX);
        let slot = contributor.get().unsigned_abs() % len;
        usize::try_from(slot).unwrap_or_default()
    }

    /// Lock the stripe owning `contributor`.
    pub(crate) fn lock(&self, contributor: ContributorId) -> Result<MutexGuard<'_, ()>, StoreError> {
        let index = self.stripe_index(contributor);
        let stripe = self
            .stripes
            .get(index)
            .ok_or(StoreError::ContentionTimeout {
                contributor,
                timeout: self.timeout,
            })?;
        stripe
            .try_lock_for(self.timeout)
            .ok_or(StoreError::ContentionTimeout {
                contributor,
                timeout: self.timeout,
            })
    }
}
