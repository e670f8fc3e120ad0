//! Render a counter store as a delimited table.
//!
//! The standard layout holds one row per contributor ordered by contributor
//! id. The extended layout appends ranking columns and orders rows by total
//! features, highest first.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::SecondsFormat;
use log::info;
use thiserror::Error;
use userstats_core::{
    ContributorCounters, ContributorId, CounterStore, FeatureKind, StoreError, Timestamp,
};
use userstats_fs::write_file_atomically;

const SECONDS_PER_DAY: i64 = 86_400;

/// Field separator of the exported table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delimiter {
    /// Comma-separated values.
    #[default]
    Comma,
    /// Tab-separated values.
    Tab,
}

impl Delimiter {
    /// The separator character.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Comma => ',',
            Self::Tab => '\t',
        }
    }

    /// Conventional file extension for the delimiter.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Comma => "csv",
            Self::Tab => "tsv",
        }
    }
}

/// Which columns the table carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportLayout {
    /// Contributor id, four groups of counts and the activity window.
    #[default]
    Standard,
    /// The standard columns followed by name and ranking columns.
    Extended,
}

/// Export tunables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Field separator.
    pub delimiter: Delimiter,
    /// Column layout.
    pub layout: ExportLayout,
}

/// Result of writing an export file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    /// Where the table was written.
    pub path: Utf8PathBuf,
    /// Data rows written, excluding the header.
    pub rows: u64,
}

/// Errors raised while exporting.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Reading the store failed.
    #[error("failed to read counters for export")]
    Store(#[from] StoreError),
    /// Writing the table failed.
    #[error("failed to write export table")]
    Write(#[source] io::Error),
    /// Moving the table into the output directory failed.
    #[error("failed to write export file {path}")]
    Persist {
        /// Target file.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

const EXTENDED_COLUMNS: [&str; 6] = [
    "displayName",
    "daysActive",
    "totalFeatures",
    "createdFeatures",
    "currentFeatures",
    "avgFeaturesPerDay",
];

/// Header names for `layout`, in column order.
///
/// # Examples
/// ```
/// use userstats_data::{ExportLayout, header_columns};
///
/// let columns = header_columns(ExportLayout::Standard);
/// assert_eq!(columns.first().map(String::as_str), Some("contributorId"));
/// assert_eq!(columns.len(), 15);
/// ```
#[must_use]
pub fn header_columns(layout: ExportLayout) -> Vec<String> {
    let mut columns = vec![String::from("contributorId")];
    for kind in FeatureKind::ALL {
        for suffix in ["total", "created", "current"] {
            columns.push(format!("{kind}_{suffix}"));
        }
    }
    columns.push(String::from("firstActivity"));
    columns.push(String::from("lastActivity"));
    if layout == ExportLayout::Extended {
        columns.extend(EXTENDED_COLUMNS.iter().map(|column| (*column).to_owned()));
    }
    columns
}

/// Write every record of `store` to `writer`, returning the row count.
pub fn write_table<S, W>(store: &S, writer: &mut W, options: ExportOptions) -> Result<u64, ExportError>
where
    S: CounterStore + ?Sized,
    W: Write + ?Sized,
{
    let mut records: Vec<_> = store.iterate()?.collect();
    if options.layout == ExportLayout::Extended {
        records.sort_by(|(left_id, left), (right_id, right)| {
            right
                .total_features()
                .cmp(&left.total_features())
                .then(left_id.cmp(right_id))
        });
    }

    let separator = options.delimiter.as_char();
    write_row(writer, separator, &header_columns(options.layout)).map_err(ExportError::Write)?;
    let mut rows = 0_u64;
    for (contributor, record) in &records {
        let fields = row_fields(*contributor, record, options.layout);
        write_row(writer, separator, &fields).map_err(ExportError::Write)?;
        rows += 1;
    }
    writer.flush().map_err(ExportError::Write)?;
    Ok(rows)
}

/// Write `store` to `<dir>/<file_name>` through a temporary file.
pub fn export_to_dir<S>(
    store: &S,
    dir: &Utf8Path,
    file_name: &str,
    options: ExportOptions,
) -> Result<ExportSummary, ExportError>
where
    S: CounterStore + ?Sized,
{
    let path = dir.join(file_name);
    let mut table_error = None;
    let mut rows = 0;
    let written = write_file_atomically(dir, file_name, |writer| {
        match write_table(store, writer, options) {
            Ok(count) => {
                rows = count;
                Ok(())
            }
            Err(ExportError::Write(source)) => Err(source),
            Err(err) => {
                table_error = Some(err);
                Err(io::Error::other("export aborted"))
            }
        }
    });
    if let Some(err) = table_error {
        return Err(err);
    }
    written.map_err(|source| ExportError::Persist {
        path: path.clone(),
        source,
    })?;
    info!("wrote {rows} contributors to {path}");
    Ok(ExportSummary { path, rows })
}

fn row_fields(
    contributor: ContributorId,
    record: &ContributorCounters,
    layout: ExportLayout,
) -> Vec<String> {
    let mut fields = vec![contributor.to_string()];
    for counts in record.counts() {
        fields.push(counts.total.to_string());
        fields.push(counts.created.to_string());
        fields.push(counts.currently_owned.to_string());
    }
    fields.push(format_timestamp(record.first_activity()));
    fields.push(format_timestamp(record.last_activity()));
    if layout == ExportLayout::Extended {
        let days = days_active(record.first_activity(), record.last_activity());
        let total = record.total_features();
        fields.push(record.display_name().unwrap_or_default().to_owned());
        fields.push(days.to_string());
        fields.push(total.to_string());
        fields.push(record.created_features().to_string());
        fields.push(record.current_features().to_string());
        fields.push(per_day(total, days));
    }
    fields
}

fn format_timestamp(at: Timestamp) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Whole days spanned by the activity window, at least one.
fn days_active(first: Timestamp, last: Timestamp) -> u64 {
    let seconds = (last - first).num_seconds().max(0);
    let days = (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;
    u64::try_from(days).unwrap_or(u64::MAX).max(1)
}

/// `total / days` rounded to two decimal places.
fn per_day(total: u64, days: u64) -> String {
    let hundredths = total
        .saturating_mul(100)
        .saturating_add(days / 2)
        .checked_div(days)
        .unwrap_or_default();
    format!("{}.{:02}", hundredths / 100, hundredths % 100)
}

fn write_row<W: Write + ?Sized>(writer: &mut W, separator: char, fields: &[String]) -> io::Result<()> {
    let mut line = String::new();
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            line.push(separator);
        }
        push_field(&mut line, field, separator);
    }
    line.push('\n');
    writer.write_all(line.as_bytes())
}

/// Append `field`, quoting it when it contains the separator, a quote or a
/// line break.
fn push_field(line: &mut String, field: &str, separator: char) {
    let needs_quotes = field
        .chars()
        .any(|ch| ch == separator || ch == '"' || ch == '\n' || ch == '\r');
    if !needs_quotes {
        line.push_str(field);
        return;
    }
    line.push('"');
    for ch in field.chars() {
        if ch == '"' {
            line.push('"');
        }
        line.push(ch);
    }
    line.push('"');
}
