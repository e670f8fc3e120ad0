//! Fixture helpers shared by the archive tests.

use base64::{Engine as _, engine::general_purpose};
use camino::Utf8PathBuf;
use std::{fs, path::Path};

/// Directory containing the encoded fixture archives.
pub fn fixtures_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Decode the Base64 fixture `<stem>.osh.pbf.b64` into `dir/<stem>.osh.pbf`.
pub fn decode_fixture(dir: &Path, stem: &str) -> Utf8PathBuf {
    let encoded_path = fixtures_dir().join(format!("{stem}.osh.pbf.b64"));
    let encoded = fs::read_to_string(&encoded_path).unwrap_or_else(|err| {
        panic!("failed to read base64 fixture {encoded_path}: {err}");
    });
    let cleaned: String = encoded
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    let decoded = general_purpose::STANDARD
        .decode(cleaned.as_bytes())
        .unwrap_or_else(|err| {
            panic!("failed to decode base64 fixture {encoded_path}: {err}");
        });
    let target = Utf8PathBuf::from_path_buf(dir.join(format!("{stem}.osh.pbf")))
        .unwrap_or_else(|path| panic!("fixture path {path:?} is not UTF-8"));
    fs::write(&target, decoded).unwrap_or_else(|err| {
        panic!("failed to write decoded fixture {target}: {err}");
    });
    target
}
