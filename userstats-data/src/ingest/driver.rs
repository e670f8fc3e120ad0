//! Drive revision batches through per-channel run detectors.
//!
//! In [`DriverMode::Concurrent`] every channel gets a worker thread fed by a
//! bounded queue, so the reader blocks when a channel falls behind. The
//! workers share nothing but the aggregator and its store. Detectors are only
//! flushed once the source reports end of archive; a failing source leaves
//! in-flight runs unapplied.

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender},
    },
    thread,
    time::{Duration, Instant},
};

use log::{error, info, warn};
use thiserror::Error;
use userstats_core::{
    Aggregator, CompletionEvent, CounterStore, FeatureKind, PerChannel, RevisionTuple,
    RunDetector, RunDetectorError, StoreError,
};

use super::{ArchiveReadError, RevisionSource};

/// How the driver schedules channel work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverMode {
    /// One worker thread per channel.
    #[default]
    Concurrent,
    /// Everything on the calling thread.
    Sequential,
}

/// Driver tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    /// Scheduling mode.
    pub mode: DriverMode,
    /// Batches buffered per channel in concurrent mode.
    pub queue_depth: usize,
    /// Completed features between progress log lines, per channel. Zero
    /// disables progress logging.
    pub progress_interval: u64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            mode: DriverMode::default(),
            queue_depth: 16,
            progress_interval: 1_000_000,
        }
    }
}

/// Counts gathered by one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelReport {
    /// Tuples observed.
    pub tuples: u64,
    /// Completion events applied.
    pub features: u64,
    /// Sum of the revision counts of those events.
    pub revisions: u64,
}

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Per-channel counts.
    pub channels: PerChannel<ChannelReport>,
    /// Distinct contributors in the store afterwards.
    pub contributors: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl IngestReport {
    /// Tuples observed across channels.
    #[must_use]
    pub fn tuples(&self) -> u64 {
        self.channels.iter().map(|(_, report)| report.tuples).sum()
    }

    /// Features completed across channels.
    #[must_use]
    pub fn features(&self) -> u64 {
        self.channels.iter().map(|(_, report)| report.features).sum()
    }
}

/// Errors that abort an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The source failed.
    #[error(transparent)]
    Archive(#[from] ArchiveReadError),
    /// A channel delivered revisions out of order.
    #[error(transparent)]
    Detector(#[from] RunDetectorError),
    /// The store rejected an update.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A channel worker panicked.
    #[error("{channel} channel worker panicked")]
    WorkerPanicked {
        /// Channel whose worker died.
        channel: FeatureKind,
    },
    /// Completed runs did not account for every observed tuple.
    #[error("{channel} channel observed {tuples} tuples but completed {revisions} revisions")]
    RevisionMismatch {
        /// Channel that lost revisions.
        channel: FeatureKind,
        /// Tuples observed.
        tuples: u64,
        /// Revisions carried by completion events.
        revisions: u64,
    },
}

enum ChannelMessage {
    Batch(Vec<RevisionTuple>),
    EndOfArchive,
}

/// State owned by one channel for the duration of a run.
struct ChannelWorker<'a, S> {
    detector: RunDetector,
    aggregator: &'a Aggregator<S>,
    report: ChannelReport,
    progress_interval: u64,
}

impl<'a, S: CounterStore> ChannelWorker<'a, S> {
    const fn new(kind: FeatureKind, aggregator: &'a Aggregator<S>, progress_interval: u64) -> Self {
        Self {
            detector: RunDetector::new(kind),
            aggregator,
            report: ChannelReport {
                tuples: 0,
                features: 0,
                revisions: 0,
            },
            progress_interval,
        }
    }

    fn process(&mut self, tuples: Vec<RevisionTuple>) -> Result<(), IngestError> {
        for tuple in tuples {
            let completed = self.detector.observe(tuple)?;
            self.report.tuples += 1;
            if let Some(event) = completed {
                self.complete(&event)?;
            }
        }
        Ok(())
    }

    fn complete(&mut self, event: &CompletionEvent) -> Result<(), IngestError> {
        self.aggregator.apply(event).inspect_err(|err| {
            error!(
                "failed to record {} {} for contributor {}: {err}",
                event.kind, event.feature_id, event.contributor
            );
        })?;
        self.report.features += 1;
        self.report.revisions += u64::from(event.revision_count);
        if self.progress_interval > 0 && self.report.features % self.progress_interval == 0 {
            info!(
                "{} channel: {} features completed, {} revisions",
                event.kind, self.report.features, self.report.revisions
            );
        }
        Ok(())
    }

    fn finish(mut self) -> Result<ChannelReport, IngestError> {
        if let Some(event) = self.detector.flush() {
            self.complete(&event)?;
        }
        let channel = self.detector.channel();
        if self.report.revisions != self.report.tuples {
            return Err(IngestError::RevisionMismatch {
                channel,
                tuples: self.report.tuples,
                revisions: self.report.revisions,
            });
        }
        Ok(self.report)
    }

    /// Consume queued batches until end of archive or disconnection.
    ///
    /// Returns `None` when the queue closed without an end-of-archive marker,
    /// in which case the in-flight run is dropped.
    fn drain(
        mut self,
        queue: Receiver<ChannelMessage>,
        stop: &AtomicBool,
    ) -> Result<Option<ChannelReport>, IngestError> {
        let channel = self.detector.channel();
        for message in queue {
            let outcome = match message {
                ChannelMessage::Batch(tuples) => self.process(tuples),
                ChannelMessage::EndOfArchive => {
                    return self
                        .finish()
                        .map(Some)
                        .inspect_err(|_| stop.store(true, Ordering::Release));
                }
            };
            if let Err(err) = outcome {
                stop.store(true, Ordering::Release);
                return Err(err);
            }
        }
        warn!("{channel} channel closed before end of archive; dropping the run in progress");
        Ok(None)
    }
}

struct ChannelLink<'scope> {
    queue: SyncSender<ChannelMessage>,
    worker: thread::ScopedJoinHandle<'scope, Result<Option<ChannelReport>, IngestError>>,
}

/// Feeds a [`RevisionSource`] through one [`RunDetector`] per channel.
///
/// # Examples
/// ```
/// use chrono::{TimeZone, Utc};
/// use userstats_core::test_support::MemoryCounterStore;
/// use userstats_core::{Aggregator, ContributorId, FeatureKind, RevisionTuple};
/// use userstats_data::{DriverOptions, InMemorySource, RevisionBatch, StreamDriver};
///
/// # fn main() -> Result<(), userstats_data::IngestError> {
/// let at = Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap();
/// let tuples = vec![
///     RevisionTuple::new(FeatureKind::Way, 5, 1, at, ContributorId::new(1)),
///     RevisionTuple::new(FeatureKind::Way, 5, 2, at, ContributorId::new(2)),
/// ];
/// let source = InMemorySource::new(vec![RevisionBatch::new(FeatureKind::Way, tuples)]);
/// let driver = StreamDriver::new(
///     Aggregator::new(MemoryCounterStore::default()),
///     DriverOptions::default(),
/// );
/// let report = driver.run(source)?;
/// assert_eq!(report.features(), 1);
/// assert_eq!(report.contributors, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StreamDriver<S> {
    aggregator: Aggregator<S>,
    options: DriverOptions,
}

impl<S: CounterStore> StreamDriver<S> {
    /// Drive batches into `aggregator`.
    pub const fn new(aggregator: Aggregator<S>, options: DriverOptions) -> Self {
        Self {
            aggregator,
            options,
        }
    }

    /// Borrow the aggregator.
    pub const fn aggregator(&self) -> &Aggregator<S> {
        &self.aggregator
    }

    /// Release the aggregator and its store.
    pub fn into_aggregator(self) -> Aggregator<S> {
        self.aggregator
    }

    /// Ingest every batch of `source`.
    ///
    /// On error, counts already applied stay in the store but runs still in
    /// progress are discarded.
    pub fn run<R: RevisionSource>(&self, source: R) -> Result<IngestReport, IngestError> {
        let started = Instant::now();
        let name = source.describe();
        info!("ingesting {name} ({:?} mode)", self.options.mode);
        let outcome = match self.options.mode {
            DriverMode::Sequential => self.run_sequential(source),
            DriverMode::Concurrent => self.run_concurrent(source),
        };
        let channels = outcome.inspect_err(|err| error!("ingestion of {name} failed: {err}"))?;
        let report = IngestReport {
            channels,
            contributors: self.aggregator.store().count()?,
            elapsed: started.elapsed(),
        };
        info!(
            "ingested {name}: {} tuples, {} features, {} contributors in {:.1?}",
            report.tuples(),
            report.features(),
            report.contributors,
            report.elapsed
        );
        Ok(report)
    }

    fn run_sequential<R: RevisionSource>(
        &self,
        source: R,
    ) -> Result<PerChannel<ChannelReport>, IngestError> {
        let interval = self.options.progress_interval;
        let mut workers =
            PerChannel::from_fn(|kind| ChannelWorker::new(kind, &self.aggregator, interval));
        let mut failure = None;
        let read = source.read_batches(&mut |batch| {
            match workers.get_mut(batch.kind).process(batch.tuples) {
                Ok(()) => ControlFlow::Continue(()),
                Err(err) => {
                    failure = Some(err);
                    ControlFlow::Break(())
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
        read?;

        let PerChannel {
            point,
            node,
            way,
            relation,
        } = workers;
        Ok(PerChannel {
            point: point.finish()?,
            node: node.finish()?,
            way: way.finish()?,
            relation: relation.finish()?,
        })
    }

    fn run_concurrent<R: RevisionSource>(
        &self,
        source: R,
    ) -> Result<PerChannel<ChannelReport>, IngestError> {
        let stop = AtomicBool::new(false);
        let depth = self.options.queue_depth.max(1);
        let interval = self.options.progress_interval;

        thread::scope(|scope| {
            let links = PerChannel::from_fn(|kind| {
                let (queue, receiver) = mpsc::sync_channel(depth);
                let worker = ChannelWorker::new(kind, &self.aggregator, interval);
                let stop = &stop;
                ChannelLink {
                    queue,
                    worker: scope.spawn(move || worker.drain(receiver, stop)),
                }
            });

            let read = source.read_batches(&mut |batch| {
                if stop.load(Ordering::Acquire) {
                    return ControlFlow::Break(());
                }
                let link = links.get(batch.kind);
                match link.queue.send(ChannelMessage::Batch(batch.tuples)) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                }
            });

            if read.is_ok() && !stop.load(Ordering::Acquire) {
                for (_, link) in links.iter() {
                    // A closed queue means the worker already failed; its
                    // error surfaces on join.
                    if link.queue.send(ChannelMessage::EndOfArchive).is_err() {
                        break;
                    }
                }
            }

            let outcomes = links.map(|channel, link| {
                drop(link.queue);
                link.worker
                    .join()
                    .unwrap_or_else(|_| Err(IngestError::WorkerPanicked { channel }))
            });
            collect_outcomes(outcomes, read)
        })
    }
}

/// Combine worker outcomes, preferring the first worker error over a
/// reader error.
fn collect_outcomes(
    outcomes: PerChannel<Result<Option<ChannelReport>, IngestError>>,
    read: Result<(), ArchiveReadError>,
) -> Result<PerChannel<ChannelReport>, IngestError> {
    let PerChannel {
        point,
        node,
        way,
        relation,
    } = outcomes;
    let (point, node, way, relation) = (point?, node?, way?, relation?);
    read?;
    match (point, node, way, relation) {
        (Some(point), Some(node), Some(way), Some(relation)) => Ok(PerChannel {
            point,
            node,
            way,
            relation,
        }),
        _ => Err(IngestError::Archive(ArchiveReadError::Reader {
            source: "source stopped before end of archive".into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{InMemorySource, RevisionBatch};
    use chrono::{DateTime, Utc};
    use rstest::rstest;
    use userstats_core::ContributorId;
    use userstats_core::test_support::MemoryCounterStore;

    fn tuple(kind: FeatureKind, id: i64, version: u32, who: i64) -> RevisionTuple {
        let at = DateTime::<Utc>::from_timestamp(1_250_000_000 + i64::from(version), 0)
            .expect("timestamp in range");
        RevisionTuple::new(kind, id, version, at, ContributorId::new(who))
    }

    fn driver(mode: DriverMode) -> StreamDriver<MemoryCounterStore> {
        StreamDriver::new(
            Aggregator::new(MemoryCounterStore::default()),
            DriverOptions {
                mode,
                queue_depth: 1,
                progress_interval: 1,
            },
        )
    }

    fn batches() -> Vec<RevisionBatch> {
        vec![
            RevisionBatch::new(
                FeatureKind::Node,
                vec![
                    tuple(FeatureKind::Node, 1, 1, 10),
                    tuple(FeatureKind::Node, 1, 2, 11),
                ],
            ),
            RevisionBatch::new(FeatureKind::Way, vec![tuple(FeatureKind::Way, 4, 1, 10)]),
            RevisionBatch::new(
                FeatureKind::Node,
                vec![
                    tuple(FeatureKind::Node, 1, 3, 12),
                    tuple(FeatureKind::Node, 2, 1, 10),
                ],
            ),
        ]
    }

    #[rstest]
    #[case(DriverMode::Sequential)]
    #[case(DriverMode::Concurrent)]
    fn runs_spanning_batches_complete_once(#[case] mode: DriverMode) {
        let driver = driver(mode);
        let report = driver.run(InMemorySource::new(batches())).expect("ingest");

        assert_eq!(report.channels.node.tuples, 4);
        assert_eq!(report.channels.node.features, 2);
        assert_eq!(report.channels.way.features, 1);
        assert_eq!(report.channels.point, ChannelReport::default());
        // Contributor 11 authored neither the first nor the latest revision.
        assert_eq!(report.contributors, 2);

        let store = driver.aggregator().store();
        let owner = store
            .get(ContributorId::new(12))
            .expect("read")
            .expect("owner exists");
        assert_eq!(owner.node.total, 1);
        assert_eq!(owner.node.created, 0);
    }

    #[rstest]
    #[case(DriverMode::Sequential)]
    #[case(DriverMode::Concurrent)]
    fn ordering_violation_aborts(#[case] mode: DriverMode) {
        let source = InMemorySource::new(vec![
            RevisionBatch::new(FeatureKind::Way, vec![tuple(FeatureKind::Way, 9, 1, 1)]),
            RevisionBatch::new(FeatureKind::Way, vec![tuple(FeatureKind::Way, 3, 1, 1)]),
        ]);
        let err = driver(mode).run(source).expect_err("out of order");
        assert!(matches!(
            err,
            IngestError::Detector(RunDetectorError::OrderingViolation { .. })
        ));
    }

    #[rstest]
    #[case(DriverMode::Sequential)]
    #[case(DriverMode::Concurrent)]
    fn source_failure_drops_in_flight_runs(#[case] mode: DriverMode) {
        let driver = driver(mode);
        let source = InMemorySource::new(batches()).failing_after(2);
        let err = driver.run(source).expect_err("interrupted source");
        assert!(matches!(err, IngestError::Archive(_)));
        // Node 1 was still in flight and way 4 never saw end of archive.
        assert_eq!(driver.aggregator().store().count().expect("count"), 0);
    }

    #[rstest]
    #[case(DriverMode::Sequential)]
    #[case(DriverMode::Concurrent)]
    fn misrouted_batch_aborts(#[case] mode: DriverMode) {
        let source = InMemorySource::new(vec![RevisionBatch::new(
            FeatureKind::Relation,
            vec![tuple(FeatureKind::Way, 1, 1, 1)],
        )]);
        let err = driver(mode).run(source).expect_err("channel mismatch");
        assert!(matches!(
            err,
            IngestError::Detector(RunDetectorError::ChannelMismatch { .. })
        ));
    }

    #[rstest]
    #[case(DriverMode::Sequential)]
    #[case(DriverMode::Concurrent)]
    fn empty_source_yields_empty_report(#[case] mode: DriverMode) {
        let report = driver(mode)
            .run(InMemorySource::default())
            .expect("ingest");
        assert_eq!(report.tuples(), 0);
        assert_eq!(report.contributors, 0);
    }

    #[rstest]
    fn closed_store_aborts_ingestion() {
        let driver = driver(DriverMode::Concurrent);
        driver.aggregator().store().close().expect("close");
        let err = driver
            .run(InMemorySource::new(batches()))
            .expect_err("closed store");
        assert!(matches!(err, IngestError::Store(StoreError::Closed)));
    }
}
