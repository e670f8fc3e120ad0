//! The fixed-shape counter record persisted per contributor.

use thiserror::Error;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::model::{FeatureKind, Timestamp};

/// Counts for one feature kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KindCounters {
    /// Features attributed to the contributor as most recent author.
    pub total: u64,
    /// Features whose first-seen revision the contributor authored.
    pub created: u64,
    /// Features whose most recent revision the contributor authored.
    pub currently_owned: u64,
}

/// Errors returned by [`ContributorCounters::from_parts`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CounterRecordError {
    /// The activity window ends before it starts.
    #[error("first activity {first} is after last activity {last}")]
    InvertedActivityWindow {
        /// Earliest recorded activity.
        first: Timestamp,
        /// Latest recorded activity.
        last: Timestamp,
    },
}

/// Activity counters for a single contributor.
///
/// Records start with zero counts and an activity window collapsed onto the
/// time of the event that created them. The window only ever widens.
///
/// # Examples
/// ```
/// use chrono::{TimeZone, Utc};
/// use userstats_core::{ContributorCounters, FeatureKind};
///
/// let at = Utc.with_ymd_and_hms(2012, 3, 4, 5, 6, 7).unwrap();
/// let mut record = ContributorCounters::new(at);
/// record.kind_mut(FeatureKind::Way).total += 1;
/// assert_eq!(record.kind(FeatureKind::Way).total, 1);
/// assert_eq!(record.first_activity(), at);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContributorCounters {
    /// Counts for nodes that never carried tags.
    pub point: KindCounters,
    /// Counts for nodes tagged in at least one revision.
    pub node: KindCounters,
    /// Counts for ways.
    pub way: KindCounters,
    /// Counts for relations.
    pub relation: KindCounters,
    first_activity: Timestamp,
    last_activity: Timestamp,
    display_name: Option<String>,
}

impl ContributorCounters {
    /// Create an empty record whose activity window is `at..=at`.
    #[must_use]
    pub const fn new(at: Timestamp) -> Self {
        Self {
            point: KindCounters {
                total: 0,
                created: 0,
                currently_owned: 0,
            },
            node: KindCounters {
                total: 0,
                created: 0,
                currently_owned: 0,
            },
            way: KindCounters {
                total: 0,
                created: 0,
                currently_owned: 0,
            },
            relation: KindCounters {
                total: 0,
                created: 0,
                currently_owned: 0,
            },
            first_activity: at,
            last_activity: at,
            display_name: None,
        }
    }

    /// Rebuild a record from stored parts, validating the activity window.
    pub fn from_parts(
        counts: [KindCounters; 4],
        first_activity: Timestamp,
        last_activity: Timestamp,
        display_name: Option<String>,
    ) -> Result<Self, CounterRecordError> {
        if first_activity > last_activity {
            return Err(CounterRecordError::InvertedActivityWindow {
                first: first_activity,
                last: last_activity,
            });
        }
        let [point, node, way, relation] = counts;
        Ok(Self {
            point,
            node,
            way,
            relation,
            first_activity,
            last_activity,
            display_name,
        })
    }

    /// Borrow the counters for `kind`.
    #[must_use]
    pub const fn kind(&self, kind: FeatureKind) -> &KindCounters {
        match kind {
            FeatureKind::Point => &self.point,
            FeatureKind::Node => &self.node,
            FeatureKind::Way => &self.way,
            FeatureKind::Relation => &self.relation,
        }
    }

    /// Mutably borrow the counters for `kind`.
    pub const fn kind_mut(&mut self, kind: FeatureKind) -> &mut KindCounters {
        match kind {
            FeatureKind::Point => &mut self.point,
            FeatureKind::Node => &mut self.node,
            FeatureKind::Way => &mut self.way,
            FeatureKind::Relation => &mut self.relation,
        }
    }

    /// Earliest revision timestamp attributed to the contributor.
    #[must_use]
    pub const fn first_activity(&self) -> Timestamp {
        self.first_activity
    }

    /// Latest revision timestamp attributed to the contributor.
    #[must_use]
    pub const fn last_activity(&self) -> Timestamp {
        self.last_activity
    }

    /// Most recently observed display name.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Widen the activity window so that it includes `at`.
    pub fn record_activity(&mut self, at: Timestamp) {
        self.first_activity = self.first_activity.min(at);
        self.last_activity = self.last_activity.max(at);
    }

    /// Replace the display name when a newer one is known.
    pub fn set_display_name(&mut self, name: Option<&str>) {
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            self.display_name = Some(name.to_owned());
        }
    }

    /// Counts for every kind in archive order.
    #[must_use]
    pub const fn counts(&self) -> [KindCounters; 4] {
        [self.point, self.node, self.way, self.relation]
    }

    /// Sum of `total` across kinds.
    #[must_use]
    pub fn total_features(&self) -> u64 {
        self.counts().iter().map(|counts| counts.total).sum()
    }

    /// Sum of `created` across kinds.
    #[must_use]
    pub fn created_features(&self) -> u64 {
        self.counts().iter().map(|counts| counts.created).sum()
    }

    /// Sum of `currently_owned` across kinds.
    #[must_use]
    pub fn current_features(&self) -> u64 {
        self.counts().iter().map(|counts| counts.currently_owned).sum()
    }
}
