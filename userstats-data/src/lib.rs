//! Archive reading, stream driving and export for contributor statistics.
//!
//! Responsibilities:
//! - Adapt OSM history archives into ordered per-channel revision batches.
//! - Drive one run detector per channel and route completed features into
//!   the aggregator.
//! - Render a counter store as a delimited table.
//!
//! Boundaries:
//! - Attribution rules live in `userstats-core`.
//! - Decoding of the PBF wire format is delegated to `osmpbf`.

#![forbid(unsafe_code)]

pub mod export;
pub mod ingest;

pub use export::{
    Delimiter, ExportError, ExportLayout, ExportOptions, ExportSummary, export_to_dir,
    header_columns, write_table,
};
pub use ingest::{
    ArchiveReadError, ChannelReport, DriverMode, DriverOptions, InMemorySource, IngestError,
    IngestReport, PbfHistorySource, RevisionBatch, RevisionSource, StreamDriver,
};
