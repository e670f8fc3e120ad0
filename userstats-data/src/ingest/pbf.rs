//! Revision source over OSM PBF history archives.
//!
//! Every `PrimitiveBlock` of the archive becomes up to four batches, one per
//! channel with at least one revision in the block. A node whose history
//! carries tags in any revision goes to the node channel, every other node to
//! the point channel. Node revisions are therefore held back until the next
//! element shows the node's history has ended, which may be in a later block.

use std::{io::BufReader, ops::ControlFlow};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use log::{debug, info};
use osmpbf::{BlobDecode, BlobReader, Element};
use userstats_core::{ContributorId, FeatureKind, PerChannel, RevisionPayload, RevisionTuple};
use userstats_fs::open_utf8_file;

use super::{ArchiveReadError, RevisionBatch, RevisionSource};

/// Reads `.osh.pbf` / `.osm.pbf` archives that carry revision metadata.
///
/// # Examples
/// ```no_run
/// use std::ops::ControlFlow;
/// use userstats_data::{PbfHistorySource, RevisionSource};
///
/// # fn main() -> Result<(), userstats_data::ArchiveReadError> {
/// let mut revisions = 0;
/// PbfHistorySource::new("history.osh.pbf").read_batches(&mut |batch| {
///     revisions += batch.tuples.len();
///     ControlFlow::Continue(())
/// })?;
/// println!("{revisions} revisions");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PbfHistorySource {
    path: Utf8PathBuf,
}

impl PbfHistorySource {
    /// Read the archive at `path`.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Archive location.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn decode_error(&self, source: osmpbf::Error) -> ArchiveReadError {
        ArchiveReadError::Decode {
            path: self.path.clone(),
            source,
        }
    }
}

impl RevisionSource for PbfHistorySource {
    fn describe(&self) -> String {
        self.path.to_string()
    }

    fn read_batches(
        self,
        sink: &mut dyn FnMut(RevisionBatch) -> ControlFlow<()>,
    ) -> Result<(), ArchiveReadError> {
        let file = open_utf8_file(&self.path).map_err(|source| ArchiveReadError::Open {
            path: self.path.clone(),
            source,
        })?;
        let reader = BlobReader::new(BufReader::new(file));
        let mut splitter = ChannelSplitter::default();
        let mut blocks = 0_u64;

        for blob in reader {
            let blob = blob.map_err(|source| self.decode_error(source))?;
            let block = match blob.decode().map_err(|source| self.decode_error(source))? {
                BlobDecode::OsmData(block) => block,
                BlobDecode::OsmHeader(_) => {
                    debug!("skipping header block of {}", self.path);
                    continue;
                }
                BlobDecode::Unknown(kind) => {
                    debug!("skipping unknown block type {kind} in {}", self.path);
                    continue;
                }
            };
            blocks += 1;
            for element in block.elements() {
                let revision = raw_revision(&element);
                let tagged = revision.tagged;
                splitter.push(revision.into_tuple()?, tagged);
            }
            if deliver(sink, splitter.take_batches()).is_break() {
                info!("stopped reading {} after {blocks} blocks", self.path);
                return Ok(());
            }
        }
        if deliver(sink, splitter.finish()).is_break() {
            info!("stopped reading {} at its last node", self.path);
            return Ok(());
        }
        debug!("read {blocks} data blocks from {}", self.path);
        Ok(())
    }
}

/// Metadata common to every element type.
struct RawRevision<'a> {
    kind: FeatureKind,
    feature_id: i64,
    version: Option<i32>,
    milli_timestamp: Option<i64>,
    uid: Option<i32>,
    user: Option<&'a str>,
    changeset: Option<i64>,
    tagged: bool,
}

impl RawRevision<'_> {
    fn into_tuple(self) -> Result<RevisionTuple, ArchiveReadError> {
        let Self {
            kind,
            feature_id,
            version,
            milli_timestamp,
            uid,
            user,
            changeset,
            tagged: _,
        } = self;
        let missing = |field| ArchiveReadError::MissingMetadata {
            kind,
            feature_id,
            field,
        };
        let invalid = |field, value| ArchiveReadError::InvalidMetadata {
            kind,
            feature_id,
            field,
            value,
        };

        let raw_version = version.ok_or_else(|| missing("version"))?;
        let version = u32::try_from(raw_version)
            .map_err(|_| invalid("version", i64::from(raw_version)))?;
        let millis = milli_timestamp.ok_or_else(|| missing("timestamp"))?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| invalid("timestamp", millis))?;
        let contributor = uid.map_or(ContributorId::ANONYMOUS, |uid| {
            ContributorId::new(i64::from(uid))
        });
        let payload = RevisionPayload {
            changeset: changeset.unwrap_or_default(),
            contributor_name: user.filter(|name| !name.is_empty()).map(str::to_owned),
        };
        Ok(RevisionTuple::new(kind, feature_id, version, timestamp, contributor)
            .with_payload(payload))
    }
}

const fn node_kind(tagged: bool) -> FeatureKind {
    if tagged {
        FeatureKind::Node
    } else {
        FeatureKind::Point
    }
}

fn raw_revision<'a>(element: &'a Element<'a>) -> RawRevision<'a> {
    match element {
        Element::Node(node) => {
            let tagged = node.tags().next().is_some();
            let info = node.info();
            RawRevision {
                kind: node_kind(tagged),
                feature_id: node.id(),
                version: info.version(),
                milli_timestamp: info.milli_timestamp(),
                uid: info.uid(),
                user: info.user().and_then(Result::ok),
                changeset: info.changeset(),
                tagged,
            }
        }
        Element::DenseNode(node) => {
            let tagged = node.tags().next().is_some();
            let info = node.info();
            RawRevision {
                kind: node_kind(tagged),
                feature_id: node.id(),
                version: info.map(|info| info.version()),
                milli_timestamp: info.map(|info| info.milli_timestamp()),
                uid: info.map(|info| info.uid()),
                user: info.and_then(|info| info.user().ok()),
                changeset: info.map(|info| info.changeset()),
                tagged,
            }
        }
        Element::Way(way) => {
            let info = way.info();
            RawRevision {
                kind: FeatureKind::Way,
                feature_id: way.id(),
                version: info.version(),
                milli_timestamp: info.milli_timestamp(),
                uid: info.uid(),
                user: info.user().and_then(Result::ok),
                changeset: info.changeset(),
                tagged: false,
            }
        }
        Element::Relation(relation) => {
            let info = relation.info();
            RawRevision {
                kind: FeatureKind::Relation,
                feature_id: relation.id(),
                version: info.version(),
                milli_timestamp: info.milli_timestamp(),
                uid: info.uid(),
                user: info.user().and_then(Result::ok),
                changeset: info.changeset(),
                tagged: false,
            }
        }
    }
}

fn deliver(
    sink: &mut dyn FnMut(RevisionBatch) -> ControlFlow<()>,
    batches: Vec<RevisionBatch>,
) -> ControlFlow<()> {
    for batch in batches {
        sink(batch)?;
    }
    ControlFlow::Continue(())
}

/// Revisions of the node being read, held until its history is complete.
#[derive(Debug, Default)]
struct NodeHistory {
    feature_id: Option<i64>,
    tagged: bool,
    tuples: Vec<RevisionTuple>,
}

impl NodeHistory {
    /// Route the held revisions to the channel their whole history implies.
    fn flush_into(&mut self, channels: &mut PerChannel<Vec<RevisionTuple>>) {
        let kind = node_kind(self.tagged);
        let target = channels.get_mut(kind);
        target.extend(self.tuples.drain(..).map(|mut tuple| {
            tuple.kind = kind;
            tuple
        }));
        self.feature_id = None;
        self.tagged = false;
    }
}

/// Sorts decoded revisions into per-channel batches.
#[derive(Debug, Default)]
struct ChannelSplitter {
    channels: PerChannel<Vec<RevisionTuple>>,
    node: NodeHistory,
}

impl ChannelSplitter {
    fn push(&mut self, tuple: RevisionTuple, tagged: bool) {
        match tuple.kind {
            FeatureKind::Point | FeatureKind::Node => {
                if self.node.feature_id != Some(tuple.feature_id) {
                    self.node.flush_into(&mut self.channels);
                    self.node.feature_id = Some(tuple.feature_id);
                }
                self.node.tagged |= tagged;
                self.node.tuples.push(tuple);
            }
            FeatureKind::Way | FeatureKind::Relation => {
                self.node.flush_into(&mut self.channels);
                self.channels.get_mut(tuple.kind).push(tuple);
            }
        }
    }

    /// Batches for every channel with routed revisions, in channel order.
    fn take_batches(&mut self) -> Vec<RevisionBatch> {
        FeatureKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let tuples = std::mem::take(self.channels.get_mut(kind));
                (!tuples.is_empty()).then(|| RevisionBatch::new(kind, tuples))
            })
            .collect()
    }

    /// Release the last node once the archive is exhausted.
    fn finish(mut self) -> Vec<RevisionBatch> {
        self.node.flush_into(&mut self.channels);
        self.take_batches()
    }
}
