//! Revision records, feature kinds and completion events.
//!
//! These types describe what flows between the archive reader, the
//! per-channel run detectors and the aggregator. They carry no behaviour
//! beyond construction helpers and accessors.

use std::fmt;

use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Instant at which a revision was made, always in UTC.
pub type Timestamp = DateTime<Utc>;

/// Identity of the contributor who authored a revision.
///
/// OSM user ids are positive; `0` is reserved for anonymous edits found in
/// early history.
///
/// # Examples
/// ```
/// use userstats_core::ContributorId;
///
/// let id = ContributorId::new(42);
/// assert_eq!(id.get(), 42);
/// assert_eq!(id.to_string(), "42");
/// assert!(ContributorId::ANONYMOUS.is_anonymous());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ContributorId(i64);

impl ContributorId {
    /// Contributor used when the archive carries no user id.
    pub const ANONYMOUS: Self = Self(0);

    /// Wrap a raw contributor id.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Return the raw id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this id stands for an anonymous edit.
    #[must_use]
    pub const fn is_anonymous(self) -> bool {
        self.0 == Self::ANONYMOUS.0
    }
}

impl fmt::Display for ContributorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ContributorId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// The four independent revision channels.
///
/// A `Point` is a node revision without tags (a bare coordinate); a `Node`
/// is a node revision carrying at least one tag.
///
/// # Examples
/// ```
/// use userstats_core::FeatureKind;
///
/// assert_eq!(FeatureKind::Way.as_str(), "way");
/// assert_eq!("relation".parse::<FeatureKind>(), Ok(FeatureKind::Relation));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FeatureKind {
    /// Nodes that never carried tags.
    Point,
    /// Nodes tagged in at least one revision.
    Node,
    /// Way revisions.
    Way,
    /// Relation revisions.
    Relation,
}

impl FeatureKind {
    /// Every kind, in archive order.
    pub const ALL: [Self; 4] = [Self::Point, Self::Node, Self::Way, Self::Relation];

    /// Return the kind as a lowercase `&str`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeatureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "point" => Ok(Self::Point),
            "node" => Ok(Self::Node),
            "way" => Ok(Self::Way),
            "relation" => Ok(Self::Relation),
            _ => Err(format!("unknown feature kind '{s}'")),
        }
    }
}

/// One value per channel, addressed by [`FeatureKind`].
///
/// # Examples
/// ```
/// use userstats_core::{FeatureKind, PerChannel};
///
/// let mut seen = PerChannel::<u32>::default();
/// *seen.get_mut(FeatureKind::Way) += 2;
/// assert_eq!(*seen.get(FeatureKind::Way), 2);
/// assert_eq!(seen.iter().map(|(_, count)| *count).sum::<u32>(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerChannel<T> {
    /// Value for the point channel.
    pub point: T,
    /// Value for the node channel.
    pub node: T,
    /// Value for the way channel.
    pub way: T,
    /// Value for the relation channel.
    pub relation: T,
}

impl<T> PerChannel<T> {
    /// Build a value per channel from a constructor.
    pub fn from_fn(mut build: impl FnMut(FeatureKind) -> T) -> Self {
        Self {
            point: build(FeatureKind::Point),
            node: build(FeatureKind::Node),
            way: build(FeatureKind::Way),
            relation: build(FeatureKind::Relation),
        }
    }

    /// Borrow the value for `kind`.
    pub const fn get(&self, kind: FeatureKind) -> &T {
        match kind {
            FeatureKind::Point => &self.point,
            FeatureKind::Node => &self.node,
            FeatureKind::Way => &self.way,
            FeatureKind::Relation => &self.relation,
        }
    }

    /// Mutably borrow the value for `kind`.
    pub const fn get_mut(&mut self, kind: FeatureKind) -> &mut T {
        match kind {
            FeatureKind::Point => &mut self.point,
            FeatureKind::Node => &mut self.node,
            FeatureKind::Way => &mut self.way,
            FeatureKind::Relation => &mut self.relation,
        }
    }

    /// Iterate over `(kind, value)` pairs in archive order.
    pub fn iter(&self) -> impl Iterator<Item = (FeatureKind, &T)> {
        FeatureKind::ALL.into_iter().map(|kind| (kind, self.get(kind)))
    }

    /// Transform every value, keeping the channel association.
    pub fn map<U>(self, mut f: impl FnMut(FeatureKind, T) -> U) -> PerChannel<U> {
        PerChannel {
            point: f(FeatureKind::Point, self.point),
            node: f(FeatureKind::Node, self.node),
            way: f(FeatureKind::Way, self.way),
            relation: f(FeatureKind::Relation, self.relation),
        }
    }
}

/// Reader-specific details of a revision that the engine passes through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionPayload {
    /// Changeset that introduced the revision.
    pub changeset: i64,
    /// Display name of the author, when the archive records it.
    pub contributor_name: Option<String>,
}

/// One revision of one feature, as delivered by the archive reader.
///
/// Within a channel, tuples arrive in non-decreasing `feature_id` order and
/// all revisions of a feature are contiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionTuple {
    /// Stable id of the feature within its kind.
    pub feature_id: i64,
    /// Channel the revision belongs to.
    pub kind: FeatureKind,
    /// Version number of this revision.
    pub version: u32,
    /// When the revision was made.
    pub timestamp: Timestamp,
    /// Author of the revision.
    pub contributor: ContributorId,
    /// Pass-through details.
    pub payload: RevisionPayload,
}

impl RevisionTuple {
    /// Construct a tuple with an empty payload.
    #[must_use]
    pub fn new(
        kind: FeatureKind,
        feature_id: i64,
        version: u32,
        timestamp: Timestamp,
        contributor: ContributorId,
    ) -> Self {
        Self {
            feature_id,
            kind,
            version,
            timestamp,
            contributor,
            payload: RevisionPayload::default(),
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: RevisionPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// A completed feature run: every revision of one feature in one channel.
///
/// `contributor` is the author of the most recent revision and owns the
/// feature's `total` and `currently_owned` counts; `creator` is the author
/// of the first revision seen and earns the `created` count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Feature whose run completed.
    pub feature_id: i64,
    /// Channel of the feature.
    pub kind: FeatureKind,
    /// Author of the most recent revision.
    pub contributor: ContributorId,
    /// Author of the first-seen revision.
    pub creator: ContributorId,
    /// Timestamp of the first-seen revision.
    pub first_version_timestamp: Timestamp,
    /// Timestamp of the most recent revision.
    pub last_version_timestamp: Timestamp,
    /// Version number of the first-seen revision.
    pub first_version: u32,
    /// Version number of the most recent revision.
    pub last_version: u32,
    /// Number of revisions in the run.
    pub revision_count: u32,
    /// Display name of the most recent author, if known.
    pub contributor_name: Option<String>,
    /// Display name of the first-seen author, if known.
    pub creator_name: Option<String>,
}

impl CompletionEvent {
    /// Whether the most recent author also authored the first-seen revision.
    #[must_use]
    pub fn created_by_owner(&self) -> bool {
        self.creator == self.contributor
    }
}
