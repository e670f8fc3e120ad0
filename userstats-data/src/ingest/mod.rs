//! Revision sources and the stream driver.
//!
//! A [`RevisionSource`] delivers batches of [`RevisionTuple`]s, each batch
//! belonging to a single channel, in archive order. The [`StreamDriver`]
//! feeds them through one run detector per channel into an aggregator.

use std::{error::Error as StdError, ops::ControlFlow};

use camino::Utf8PathBuf;
use thiserror::Error;
use userstats_core::{FeatureKind, RevisionTuple};

mod driver;
mod pbf;

pub use driver::{
    ChannelReport, DriverMode, DriverOptions, IngestError, IngestReport, StreamDriver,
};
pub use pbf::PbfHistorySource;

/// Consecutive revisions of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionBatch {
    /// Channel every tuple belongs to.
    pub kind: FeatureKind,
    /// Tuples in archive order.
    pub tuples: Vec<RevisionTuple>,
}

impl RevisionBatch {
    /// Bundle `tuples` for `kind`.
    #[must_use]
    pub const fn new(kind: FeatureKind, tuples: Vec<RevisionTuple>) -> Self {
        Self { kind, tuples }
    }
}

/// Errors raised while reading an archive.
#[derive(Debug, Error)]
pub enum ArchiveReadError {
    /// The archive could not be opened.
    #[error("failed to open archive at {path}")]
    Open {
        /// Archive path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A block of the archive could not be decoded.
    #[error("failed to decode archive data at {path}")]
    Decode {
        /// Archive path.
        path: Utf8PathBuf,
        /// Source error returned by `osmpbf`.
        #[source]
        source: osmpbf::Error,
    },
    /// A revision lacks metadata that attribution needs.
    #[error("{kind} {feature_id} has no {field}; the archive must carry history metadata")]
    MissingMetadata {
        /// Channel of the revision.
        kind: FeatureKind,
        /// Feature the revision belongs to.
        feature_id: i64,
        /// Missing attribute.
        field: &'static str,
    },
    /// A revision carries metadata outside the representable range.
    #[error("{kind} {feature_id} has invalid {field} {value}")]
    InvalidMetadata {
        /// Channel of the revision.
        kind: FeatureKind,
        /// Feature the revision belongs to.
        feature_id: i64,
        /// Offending attribute.
        field: &'static str,
        /// Raw value found in the archive.
        value: i64,
    },
    /// Any other reader failure.
    #[error("archive reader failed")]
    Reader {
        /// Reader-specific cause.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

/// A producer of ordered revision batches.
///
/// Within each channel, tuples must arrive in non-decreasing feature id
/// order with all revisions of a feature contiguous, possibly spanning
/// batches. Batches of different channels may interleave freely.
pub trait RevisionSource {
    /// Human-readable name used in log messages.
    fn describe(&self) -> String;

    /// Deliver every batch to `sink` in archive order.
    ///
    /// The source stops early, returning `Ok(())`, as soon as `sink` returns
    /// [`ControlFlow::Break`].
    fn read_batches(
        self,
        sink: &mut dyn FnMut(RevisionBatch) -> ControlFlow<()>,
    ) -> Result<(), ArchiveReadError>;
}

/// Source replaying batches held in memory, optionally failing part way.
///
/// # Examples
/// ```
/// use std::ops::ControlFlow;
/// use userstats_data::{InMemorySource, RevisionSource};
///
/// let mut seen = 0;
/// InMemorySource::new(Vec::new())
///     .read_batches(&mut |_| {
///         seen += 1;
///         ControlFlow::Continue(())
///     })
///     .expect("empty source succeeds");
/// assert_eq!(seen, 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    batches: Vec<RevisionBatch>,
    fail_after: Option<usize>,
}

impl InMemorySource {
    /// Replay `batches` and then report end of archive.
    #[must_use]
    pub const fn new(batches: Vec<RevisionBatch>) -> Self {
        Self {
            batches,
            fail_after: None,
        }
    }

    /// Fail with [`ArchiveReadError::Reader`] after delivering `delivered`
    /// batches.
    #[must_use]
    pub const fn failing_after(mut self, delivered: usize) -> Self {
        self.fail_after = Some(delivered);
        self
    }
}

impl RevisionSource for InMemorySource {
    fn describe(&self) -> String {
        format!("in-memory source of {} batches", self.batches.len())
    }

    fn read_batches(
        self,
        sink: &mut dyn FnMut(RevisionBatch) -> ControlFlow<()>,
    ) -> Result<(), ArchiveReadError> {
        for (delivered, batch) in self.batches.into_iter().enumerate() {
            if self.fail_after == Some(delivered) {
                return Err(interrupted(delivered));
            }
            if sink(batch).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }
}

fn interrupted(delivered: usize) -> ArchiveReadError {
    ArchiveReadError::Reader {
        source: format!("source interrupted after {delivered} batches").into(),
    }
}
