//! Stats command implementation for the userstats CLI.
//!
//! Every archive in the input directory is streamed into a fresh counter
//! store, the store is closed, reopened read-only and exported next to the
//! other tables in the output directory.

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};
use userstats_core::{
    Aggregator, COUNTER_STORE_FILE_NAME, CounterStore, SqliteCounterStore, StoreError,
};
use userstats_data::{
    Delimiter, DriverMode, DriverOptions, ExportLayout, ExportOptions, ExportSummary,
    PbfHistorySource, StreamDriver, export_to_dir,
};
use userstats_fs::{DirStatus, dir_status, list_files_with_suffixes};

use crate::{
    ARG_DELIMITER, ARG_INPUT_DIR, ARG_LAYOUT, ARG_MODE, ARG_OUTPUT_DIR, ARG_STORE_DIR, CliError,
    ENV_INPUT_DIR, ENV_OUTPUT_DIR, ENV_STORE_DIR,
};

/// Archive name suffixes picked up from the input directory.
pub(crate) const ARCHIVE_SUFFIXES: [&str; 2] = [".osh.pbf", ".osm.pbf"];

/// Field separator choice for the exported tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DelimiterArg {
    /// Comma-separated values (`.csv`).
    #[default]
    Comma,
    /// Tab-separated values (`.tsv`).
    Tab,
}

impl From<DelimiterArg> for Delimiter {
    fn from(value: DelimiterArg) -> Self {
        match value {
            DelimiterArg::Comma => Self::Comma,
            DelimiterArg::Tab => Self::Tab,
        }
    }
}

/// Column layout choice for the exported tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LayoutArg {
    /// Counts and activity window only.
    #[default]
    Standard,
    /// Counts plus display name and ranking columns.
    Extended,
}

impl From<LayoutArg> for ExportLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Standard => Self::Standard,
            LayoutArg::Extended => Self::Extended,
        }
    }
}

/// Scheduling choice for the stream driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ModeArg {
    /// One worker thread per feature channel.
    #[default]
    Concurrent,
    /// All channels on the main thread.
    Sequential,
}

impl From<ModeArg> for DriverMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Concurrent => Self::Concurrent,
            ModeArg::Sequential => Self::Sequential,
        }
    }
}

/// CLI arguments for the `stats` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Aggregate every .osh.pbf and .osm.pbf archive in the input \
                 directory into a per-contributor statistics table. \
                 Directories can come from CLI flags, configuration files, \
                 or environment variables.",
    about = "Build per-contributor statistics tables"
)]
#[ortho_config(prefix = "USERSTATS")]
pub(crate) struct StatsArgs {
    /// Directory holding the history archives.
    #[arg(long = ARG_INPUT_DIR, value_name = "dir")]
    #[serde(default)]
    pub(crate) input_dir: Option<Utf8PathBuf>,
    /// Directory receiving one table per archive.
    #[arg(long = ARG_OUTPUT_DIR, value_name = "dir")]
    #[serde(default)]
    pub(crate) output_dir: Option<Utf8PathBuf>,
    /// Scratch directory for the counter store.
    #[arg(long = ARG_STORE_DIR, value_name = "dir")]
    #[serde(default)]
    pub(crate) store_dir: Option<Utf8PathBuf>,
    /// Field separator of the exported tables.
    #[arg(long = ARG_DELIMITER, value_enum)]
    #[serde(default)]
    pub(crate) delimiter: Option<DelimiterArg>,
    /// Column layout of the exported tables.
    #[arg(long = ARG_LAYOUT, value_enum)]
    #[serde(default)]
    pub(crate) layout: Option<LayoutArg>,
    /// How feature channels are scheduled.
    #[arg(long = ARG_MODE, value_enum)]
    #[serde(default)]
    pub(crate) mode: Option<ModeArg>,
}

impl StatsArgs {
    pub(crate) fn into_config(self) -> Result<StatsConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        StatsConfig::try_from(merged)
    }
}

/// Resolved `stats` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatsConfig {
    pub(crate) input_dir: Utf8PathBuf,
    pub(crate) output_dir: Utf8PathBuf,
    pub(crate) store_dir: Utf8PathBuf,
    pub(crate) delimiter: Delimiter,
    pub(crate) layout: ExportLayout,
    pub(crate) mode: DriverMode,
}

impl StatsConfig {
    /// Check the input directory exists and the other two accept writes.
    pub(crate) fn validate_directories(&self) -> Result<(), CliError> {
        Self::require_directory(&self.input_dir, ARG_INPUT_DIR, false)?;
        Self::require_directory(&self.output_dir, ARG_OUTPUT_DIR, true)?;
        Self::require_directory(&self.store_dir, ARG_STORE_DIR, true)?;
        Ok(())
    }

    fn require_directory(
        path: &Utf8Path,
        field: &'static str,
        writable: bool,
    ) -> Result<(), CliError> {
        let status = dir_status(path).map_err(|source| CliError::InspectDirectory {
            field,
            path: path.to_path_buf(),
            source,
        })?;
        match status {
            DirStatus::Writable => Ok(()),
            DirStatus::ReadOnly if !writable => Ok(()),
            DirStatus::ReadOnly => Err(CliError::ReadOnlyDirectory {
                field,
                path: path.to_path_buf(),
            }),
            DirStatus::Missing => Err(CliError::MissingDirectory {
                field,
                path: path.to_path_buf(),
            }),
            DirStatus::NotADirectory => Err(CliError::NotADirectory {
                field,
                path: path.to_path_buf(),
            }),
        }
    }

    fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            mode: self.mode,
            ..DriverOptions::default()
        }
    }

    const fn export_options(&self) -> ExportOptions {
        ExportOptions {
            delimiter: self.delimiter,
            layout: self.layout,
        }
    }

    fn store_path(&self) -> Utf8PathBuf {
        self.store_dir.join(COUNTER_STORE_FILE_NAME)
    }
}

impl TryFrom<StatsArgs> for StatsConfig {
    type Error = CliError;

    fn try_from(args: StatsArgs) -> Result<Self, Self::Error> {
        let input_dir = args.input_dir.ok_or(CliError::MissingArgument {
            field: ARG_INPUT_DIR,
            env: ENV_INPUT_DIR,
        })?;
        let output_dir = args.output_dir.ok_or(CliError::MissingArgument {
            field: ARG_OUTPUT_DIR,
            env: ENV_OUTPUT_DIR,
        })?;
        let store_dir = args.store_dir.ok_or(CliError::MissingArgument {
            field: ARG_STORE_DIR,
            env: ENV_STORE_DIR,
        })?;
        Ok(Self {
            input_dir,
            output_dir,
            store_dir,
            delimiter: args.delimiter.unwrap_or_default().into(),
            layout: args.layout.unwrap_or_default().into(),
            mode: args.mode.unwrap_or_default().into(),
        })
    }
}

pub(crate) fn run_stats(args: StatsArgs) -> Result<Vec<ExportSummary>, CliError> {
    let config = args.into_config()?;
    execute(&config)
}

/// Process every archive under `config.input_dir`, skipping failures.
///
/// Returns the written tables when every archive succeeded.
pub(crate) fn execute(config: &StatsConfig) -> Result<Vec<ExportSummary>, CliError> {
    config.validate_directories()?;
    let archives = list_files_with_suffixes(&config.input_dir, &ARCHIVE_SUFFIXES).map_err(
        |source| CliError::ListArchives {
            path: config.input_dir.clone(),
            source,
        },
    )?;
    if archives.is_empty() {
        warn!("no history archives found in {}", config.input_dir);
    }

    let total = archives.len();
    let mut failed = 0_usize;
    let mut written = Vec::with_capacity(total);
    for archive in &archives {
        match process_archive(config, archive) {
            Ok(summary) => written.push(summary),
            Err(err) => {
                error!("skipping {archive}: {err}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(CliError::ArchivesFailed { failed, total });
    }
    Ok(written)
}

fn process_archive(config: &StatsConfig, archive: &Utf8Path) -> Result<ExportSummary, CliError> {
    let store_error = |source: StoreError| CliError::Store {
        archive: archive.to_path_buf(),
        source,
    };
    let store_path = config.store_path();
    info!("aggregating {archive}");

    let store = SqliteCounterStore::open(&store_path).map_err(store_error)?;
    let driver = StreamDriver::new(Aggregator::new(store), config.driver_options());
    let ingested = driver.run(PbfHistorySource::new(archive));
    driver
        .into_aggregator()
        .into_store()
        .close()
        .map_err(store_error)?;
    let report = ingested.map_err(|source| CliError::Ingest {
        archive: archive.to_path_buf(),
        source,
    })?;
    info!(
        "{archive}: {} revisions of {} features by {} contributors in {:.1?}",
        report.tuples(),
        report.features(),
        report.contributors,
        report.elapsed
    );

    let reader = SqliteCounterStore::open_read_only(&store_path).map_err(store_error)?;
    let file_name = output_file_name(archive, config.delimiter);
    let summary = export_to_dir(
        &reader,
        &config.output_dir,
        &file_name,
        config.export_options(),
    )
    .map_err(|source| CliError::Export {
        archive: archive.to_path_buf(),
        source,
    })?;
    reader.close().map_err(store_error)?;
    Ok(summary)
}

/// `<base>.csv` or `<base>.tsv`, where `<base>` drops the archive suffix.
pub(crate) fn output_file_name(archive: &Utf8Path, delimiter: Delimiter) -> String {
    let name = archive.file_name().unwrap_or_default();
    let base = ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name);
    format!("{base}.{}", delimiter.extension())
}
