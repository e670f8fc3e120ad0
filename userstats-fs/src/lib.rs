//! Shared filesystem helpers built on `cap-std` and `camino`.
#![forbid(unsafe_code)]

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8};
use log::debug;
use std::io::{self, BufWriter, Write};

/// Open a UTF-8 file path using ambient authority.
pub fn open_utf8_file(path: &Utf8Path) -> io::Result<fs_utf8::File> {
    fs_utf8::File::open_ambient(path, ambient_authority())
}

/// Open a directory using ambient authority.
pub fn open_utf8_dir(path: &Utf8Path) -> io::Result<fs_utf8::Dir> {
    fs_utf8::Dir::open_ambient_dir(path, ambient_authority())
}

/// What a configured directory path currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    /// Nothing exists at the path.
    Missing,
    /// Something other than a directory exists at the path.
    NotADirectory,
    /// A directory exists but its permissions forbid writing.
    ReadOnly,
    /// A writable directory exists.
    Writable,
}

/// Classify `path` without following it into its contents.
pub fn dir_status(path: &Utf8Path) -> io::Result<DirStatus> {
    let metadata = match std::fs::metadata(path.as_std_path()) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(DirStatus::Missing),
        Err(err) => return Err(err),
    };
    if !metadata.is_dir() {
        return Ok(DirStatus::NotADirectory);
    }
    if metadata.permissions().readonly() {
        return Ok(DirStatus::ReadOnly);
    }
    Ok(DirStatus::Writable)
}

/// List regular files in `dir` whose names end with one of `suffixes`,
/// sorted by file name.
pub fn list_files_with_suffixes(
    dir: &Utf8Path,
    suffixes: &[&str],
) -> io::Result<Vec<Utf8PathBuf>> {
    let handle = open_utf8_dir(dir)?;
    let mut names = Vec::new();
    for entry in handle.entries()? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name()?;
        if suffixes.iter().any(|suffix| name.ends_with(suffix)) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names.into_iter().map(|name| dir.join(name)).collect())
}

/// Write `file_name` inside `dir` through a temporary sibling that is renamed
/// into place once `write` succeeds.
///
/// A failed write leaves any previous file untouched and removes the
/// temporary file.
pub fn write_file_atomically<F>(dir: &Utf8Path, file_name: &str, write: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let handle = open_utf8_dir(dir)?;
    let temp_name = format!(".{file_name}.partial");
    let result = write_and_sync(&handle, &temp_name, write)
        .and_then(|()| handle.rename(&temp_name, &handle, file_name));
    if let Err(err) = &result
        && let Err(cleanup) = handle.remove_file(&temp_name)
    {
        debug!("could not remove {temp_name} in {dir} after failed write ({err}): {cleanup}");
    }
    result
}

fn write_and_sync<F>(dir: &fs_utf8::Dir, name: &str, write: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let file = dir.create(name)?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()
}
