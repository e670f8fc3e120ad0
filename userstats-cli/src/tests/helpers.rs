//! Scratch directories shared by the stats command tests.

use base64::{Engine as _, engine::general_purpose};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use tempfile::TempDir;

use crate::stats::StatsConfig;
use userstats_data::{Delimiter, DriverMode, ExportLayout};

/// Input, output and store directories under one temporary root.
pub(super) struct StatsDirs {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl StatsDirs {
    pub(super) fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
        for name in ["input", "output", "store"] {
            fs::create_dir(root.join(name)).expect("create scratch directory");
        }
        Self { _dir: dir, root }
    }

    pub(super) fn input(&self) -> Utf8PathBuf {
        self.root.join("input")
    }

    pub(super) fn output(&self) -> Utf8PathBuf {
        self.root.join("output")
    }

    pub(super) fn store(&self) -> Utf8PathBuf {
        self.root.join("store")
    }

    pub(super) fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Drop `contents` into the input directory as `name`.
    pub(super) fn add_input(&self, name: &str, contents: &[u8]) {
        fs::write(self.input().join(name), contents).expect("write input file");
    }

    /// Decode the shared history fixture into the input directory as `name`.
    pub(super) fn add_history_archive(&self, name: &str) {
        self.add_input(name, &decode_history_fixture());
    }

    pub(super) fn config(&self) -> StatsConfig {
        StatsConfig {
            input_dir: self.input(),
            output_dir: self.output(),
            store_dir: self.store(),
            delimiter: Delimiter::Comma,
            layout: ExportLayout::Standard,
            mode: DriverMode::Sequential,
        }
    }

    /// Lines of the exported table `name`.
    pub(super) fn output_lines(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.output().join(name))
            .expect("read exported table")
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Sorted file names in the output directory.
    pub(super) fn outputs(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.output())
            .expect("read output directory")
            .map(|entry| {
                entry
                    .expect("directory entry")
                    .file_name()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        names.sort();
        names
    }
}

/// Bytes that start like a PBF blob header but never decode.
pub(super) const CORRUPT_ARCHIVE: &[u8] = b"\x00\x00\x00\x10this is not a pbf blob header";

/// Encoded history archive maintained alongside the data crate's tests.
///
/// Node 1 is tagged by contributor 10 and later edited by 20, node 2 is
/// created by 10 and edited by 30, node 3 is created by 30, way 10 is created
/// by 10 and edited by 20, relation 20 is created by 30.
fn decode_history_fixture() -> Vec<u8> {
    let path = Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../userstats-data/tests/fixtures/history.osh.pbf.b64");
    let encoded = fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("failed to read base64 fixture {path}: {err}"));
    let cleaned: String = encoded
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    general_purpose::STANDARD
        .decode(cleaned.as_bytes())
        .unwrap_or_else(|err| panic!("failed to decode base64 fixture {path}: {err}"))
}
