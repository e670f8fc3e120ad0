//! Error types emitted by the userstats CLI.
//!
//! Keep this error type reasonably small; every command helper returns
//! `Result<_, CliError>`.

use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use userstats_core::StoreError;
use userstats_data::{ExportError, IngestError};

/// Errors emitted by the userstats CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        field: &'static str,
        env: &'static str,
    },
    /// A configured directory does not exist.
    #[error("{field} directory {path:?} does not exist")]
    MissingDirectory {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A configured directory path exists but is not a directory.
    #[error("{field} path {path:?} exists but is not a directory")]
    NotADirectory {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A directory the command writes into is read-only.
    #[error("{field} directory {path:?} is not writable")]
    ReadOnlyDirectory {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A configured directory could not be inspected due to an IO error.
    #[error("failed to inspect {field} directory {path:?}: {source}")]
    InspectDirectory {
        field: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Listing the archives in the input directory failed.
    #[error("failed to list archives in {path:?}: {source}")]
    ListArchives {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Opening, closing or reopening the counter store failed.
    #[error("counter store failed while processing {archive:?}: {source}")]
    Store {
        archive: Utf8PathBuf,
        #[source]
        source: StoreError,
    },
    /// Streaming an archive into the counter store failed.
    #[error("failed to ingest {archive:?}: {source}")]
    Ingest {
        archive: Utf8PathBuf,
        #[source]
        source: IngestError,
    },
    /// Writing the statistics table for an archive failed.
    #[error("failed to export statistics for {archive:?}: {source}")]
    Export {
        archive: Utf8PathBuf,
        #[source]
        source: ExportError,
    },
    /// At least one archive could not be processed.
    #[error("{failed} of {total} archives failed")]
    ArchivesFailed { failed: usize, total: usize },
}
