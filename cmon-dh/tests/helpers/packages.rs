//! Detector package archives for installer tests

use serde_json::{json, Value};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Entry point of a well-behaved detector
pub const CLEAN_DETECTOR: &str = r#"import json
import os

COMM = "/comm"


def analyse(current, reference, config):
    return []


if __name__ == "__main__":
    with open(os.path.join(COMM, "config.json")) as handle:
        config = json.load(handle)
"#;

/// Manifest for `name` at `version` with a small config schema
pub fn manifest(name: &str, version: &str) -> Value {
    json!({
        "name": name,
        "version": version,
        "description": "Flags props that moved between takes",
        "author": "Continuity Team",
        "category": "props",
        "docker": { "base_image": "python:3.11-slim", "gpu_enabled": false },
        "schema": { "fields": {
            "threshold": { "type": "number", "min": 0.0, "max": 1.0, "default": 0.5 }
        }}
    })
}

/// Zip `entries` into `<dir>/<file_name>`
pub fn write_archive(dir: &Path, file_name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(file_name);
    let mut writer = ZipWriter::new(File::create(&path).unwrap());
    let options = SimpleFileOptions::default();
    for (name, body) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap();
    path
}

/// A package that passes validation and the security scan
pub fn clean_package(dir: &Path, name: &str, version: &str) -> PathBuf {
    let manifest = serde_json::to_vec_pretty(&manifest(name, version)).unwrap();
    write_archive(
        dir,
        &format!("{}-{}.zip", name, version),
        &[
            ("manifest.json", &manifest),
            ("detector.py", CLEAN_DETECTOR.as_bytes()),
            ("requirements.txt", b"numpy==1.26.4\n"),
        ],
    )
}

/// A package whose entry point carries `source`
pub fn package_with_source(dir: &Path, name: &str, source: &str) -> PathBuf {
    let manifest = serde_json::to_vec_pretty(&manifest(name, "1.0.0")).unwrap();
    write_archive(
        dir,
        &format!("{}-src.zip", name),
        &[("manifest.json", &manifest), ("detector.py", source.as_bytes())],
    )
}
