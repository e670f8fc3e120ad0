//! Per-channel revision run detection.
//!
//! A [`RunDetector`] groups consecutive revisions that share a feature id
//! into a single run and emits one [`CompletionEvent`] when the run ends,
//! either because a larger id arrives or because the channel is flushed.
//! Each channel owns its own detector; detector state is never shared.

use log::{debug, error};
use thiserror::Error;

use crate::model::{CompletionEvent, ContributorId, FeatureKind, RevisionTuple};

/// Errors raised while observing revisions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunDetectorError {
    /// The reader delivered a feature id lower than the run in progress.
    #[error(
        "{channel} channel is out of order: feature {received} arrived after feature {previous}"
    )]
    OrderingViolation {
        /// Channel whose ordering broke.
        channel: FeatureKind,
        /// Id of the run in progress.
        previous: i64,
        /// Id that arrived out of order.
        received: i64,
    },
    /// A revision of another kind was routed to this channel.
    #[error("{channel} channel received {received} revision of feature {feature_id}")]
    ChannelMismatch {
        /// Channel owning the detector.
        channel: FeatureKind,
        /// Kind carried by the misrouted revision.
        received: FeatureKind,
        /// Feature id of the misrouted revision.
        feature_id: i64,
    },
}

/// Summary of one revision kept while its run is open.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RevisionMark {
    contributor: ContributorId,
    contributor_name: Option<String>,
    version: u32,
    timestamp: crate::Timestamp,
}

impl RevisionMark {
    fn from_tuple(tuple: RevisionTuple) -> Self {
        Self {
            contributor: tuple.contributor,
            contributor_name: tuple.payload.contributor_name,
            version: tuple.version,
            timestamp: tuple.timestamp,
        }
    }
}

/// State of the run in progress.
///
/// `first` is the first-seen revision of the feature and `previous` the most
/// recent one; they coincide until a second revision arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureRunState {
    feature_id: i64,
    first: RevisionMark,
    previous: RevisionMark,
    revisions: u32,
}

impl FeatureRunState {
    fn start(tuple: RevisionTuple) -> Self {
        let feature_id = tuple.feature_id;
        let mark = RevisionMark::from_tuple(tuple);
        Self {
            feature_id,
            first: mark.clone(),
            previous: mark,
            revisions: 1,
        }
    }

    fn extend(&mut self, tuple: RevisionTuple) {
        self.revisions = self.revisions.saturating_add(1);
        self.previous = RevisionMark::from_tuple(tuple);
    }

    fn complete(self, kind: FeatureKind) -> CompletionEvent {
        CompletionEvent {
            feature_id: self.feature_id,
            kind,
            contributor: self.previous.contributor,
            creator: self.first.contributor,
            first_version_timestamp: self.first.timestamp,
            last_version_timestamp: self.previous.timestamp,
            first_version: self.first.version,
            last_version: self.previous.version,
            revision_count: self.revisions,
            contributor_name: self.previous.contributor_name,
            creator_name: self.first.contributor_name,
        }
    }

    /// Feature id of the run in progress.
    #[must_use]
    pub const fn feature_id(&self) -> i64 {
        self.feature_id
    }

    /// Revisions observed so far in the run.
    #[must_use]
    pub const fn revisions(&self) -> u32 {
        self.revisions
    }
}

/// Boundary detector for a single channel.
///
/// # Examples
/// ```
/// use chrono::{TimeZone, Utc};
/// use userstats_core::{ContributorId, FeatureKind, RevisionTuple, RunDetector};
///
/// # fn main() -> Result<(), userstats_core::RunDetectorError> {
/// let at = Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap();
/// let mut detector = RunDetector::new(FeatureKind::Way);
/// let revision = |id, version, who| {
///     RevisionTuple::new(FeatureKind::Way, id, version, at, ContributorId::new(who))
/// };
///
/// assert!(detector.observe(revision(7, 1, 1))?.is_none());
/// assert!(detector.observe(revision(7, 2, 2))?.is_none());
/// let event = detector.observe(revision(9, 1, 1))?.expect("run for way 7 completes");
/// assert_eq!(event.feature_id, 7);
/// assert_eq!(event.revision_count, 2);
/// assert_eq!(event.contributor, ContributorId::new(2));
/// assert_eq!(event.creator, ContributorId::new(1));
///
/// assert!(detector.flush().is_some());
/// assert!(detector.flush().is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RunDetector {
    channel: FeatureKind,
    run: Option<FeatureRunState>,
}

impl RunDetector {
    /// Create an idle detector for `channel`.
    #[must_use]
    pub const fn new(channel: FeatureKind) -> Self {
        Self { channel, run: None }
    }

    /// Channel this detector serves.
    #[must_use]
    pub const fn channel(&self) -> FeatureKind {
        self.channel
    }

    /// The run in progress, if any.
    #[must_use]
    pub const fn current_run(&self) -> Option<&FeatureRunState> {
        self.run.as_ref()
    }

    /// Feed the next revision of the channel.
    ///
    /// Returns the completion event of the previous run when `tuple` starts a
    /// new feature. An out-of-order or misrouted tuple leaves the detector
    /// untouched.
    pub fn observe(
        &mut self,
        tuple: RevisionTuple,
    ) -> Result<Option<CompletionEvent>, RunDetectorError> {
        if tuple.kind != self.channel {
            error!(
                "rejected {} revision of feature {} by contributor {} on the {} channel",
                tuple.kind, tuple.feature_id, tuple.contributor, self.channel
            );
            return Err(RunDetectorError::ChannelMismatch {
                channel: self.channel,
                received: tuple.kind,
                feature_id: tuple.feature_id,
            });
        }

        let Some(run) = self.run.as_mut() else {
            self.run = Some(FeatureRunState::start(tuple));
            return Ok(None);
        };

        if tuple.feature_id == run.feature_id {
            if tuple.version < run.previous.version {
                debug!(
                    "{} {} version {} follows version {}",
                    self.channel, tuple.feature_id, tuple.version, run.previous.version
                );
            }
            run.extend(tuple);
            return Ok(None);
        }

        if tuple.feature_id < run.feature_id {
            error!(
                "ordering violation on the {} channel: feature {} (contributor {}) after feature {}",
                self.channel, tuple.feature_id, tuple.contributor, run.feature_id
            );
            return Err(RunDetectorError::OrderingViolation {
                channel: self.channel,
                previous: run.feature_id,
                received: tuple.feature_id,
            });
        }

        let completed = self.run.replace(FeatureRunState::start(tuple));
        Ok(completed.map(|state| state.complete(self.channel)))
    }

    /// End the channel, emitting the run in progress once.
    pub fn flush(&mut self) -> Option<CompletionEvent> {
        self.run.take().map(|state| state.complete(self.channel))
    }
}
