//! Package archive extraction
//!
//! Two passes over the zip central directory: the first validates every
//! entry name and the declared sizes without touching the filesystem, the
//! second writes files. A traversal attempt therefore never leaves a
//! partial extraction behind.

use crate::error::{DetectorError, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

/// Extraction bounds
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLimits {
    pub max_entries: usize,
    pub max_uncompressed_bytes: u64,
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Check one entry name; returns the problem if unsafe
fn check_entry_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return Some("empty entry name".to_string());
    }
    if name.contains('\0') {
        return Some(format!("entry '{}' contains a NUL byte", name.escape_default()));
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Some(format!("absolute path '{}'", name));
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Some(format!("absolute path '{}'", name));
    }
    if name.split(['/', '\\']).any(|part| part == "..") {
        return Some(format!("path traversal in '{}'", name));
    }
    None
}

/// Relative path an entry extracts to
fn relative_path(name: &str) -> PathBuf {
    name.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

fn open_archive(archive_path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(archive_path)?;
    ZipArchive::new(file)
        .map_err(|e| DetectorError::Configuration(format!("Invalid package archive: {}", e)))
}

/// Validate every entry of the archive without extracting anything
pub fn inspect_archive(archive_path: &Path, limits: ArchiveLimits) -> Result<()> {
    let mut archive = open_archive(archive_path)?;

    if archive.len() > limits.max_entries {
        return Err(DetectorError::security(
            format!(
                "archive has {} entries (limit {})",
                archive.len(),
                limits.max_entries
            ),
            Vec::new(),
        ));
    }

    let mut issues = Vec::new();
    let mut seen = HashSet::new();
    let mut total: u64 = 0;

    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| DetectorError::Configuration(format!("Invalid package archive: {}", e)))?;
        let name = entry.name().to_string();

        if let Some(problem) = check_entry_name(&name) {
            issues.push(problem);
            continue;
        }
        if entry.enclosed_name().is_none() {
            issues.push(format!("entry '{}' escapes the extraction directory", name));
            continue;
        }
        if entry
            .unix_mode()
            .map(|mode| mode & S_IFMT == S_IFLNK)
            .unwrap_or(false)
        {
            issues.push(format!("symbolic link '{}'", name));
            continue;
        }
        if !entry.is_dir() && !seen.insert(relative_path(&name)) {
            issues.push(format!("duplicate entry '{}'", name));
        }
        total = total.saturating_add(entry.size());
    }

    if !issues.is_empty() {
        return Err(DetectorError::security("unsafe archive entries", issues));
    }
    if total > limits.max_uncompressed_bytes {
        return Err(DetectorError::security(
            format!(
                "archive expands to {} bytes (limit {})",
                total, limits.max_uncompressed_bytes
            ),
            Vec::new(),
        ));
    }
    Ok(())
}

/// Extract `archive_path` into `dest` and return the package root
///
/// **Algorithm:**
/// 1. [`inspect_archive`]: reject unsafe names, symlinks, duplicates and
///    oversize archives before any write
/// 2. Extract, counting actual bytes so a lying size header cannot exceed
///    the limit
/// 3. If the archive wraps everything in one top-level directory and has
///    no manifest at its root, return that directory as the package root
pub fn extract_package(archive_path: &Path, dest: &Path, limits: ArchiveLimits) -> Result<PathBuf> {
    inspect_archive(archive_path, limits)?;

    let mut archive = open_archive(archive_path)?;
    fs::create_dir_all(dest)?;

    let mut written: u64 = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| DetectorError::Configuration(format!("Invalid package archive: {}", e)))?;
        let relative = relative_path(entry.name());
        if relative.as_os_str().is_empty() {
            continue;
        }
        debug_assert!(relative.components().all(|c| matches!(c, Component::Normal(_))));
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let remaining = limits.max_uncompressed_bytes.saturating_sub(written);
        let mut out = File::create(&target)?;
        let copied = io::copy(&mut (&mut entry).take(remaining.saturating_add(1)), &mut out)?;
        written += copied;
        if written > limits.max_uncompressed_bytes {
            return Err(DetectorError::security(
                format!(
                    "archive expands beyond {} bytes",
                    limits.max_uncompressed_bytes
                ),
                Vec::new(),
            ));
        }
    }

    debug!(archive = %archive_path.display(), bytes = written, "Package extracted");
    Ok(unwrap_single_directory(dest)?)
}

fn unwrap_single_directory(dest: &Path) -> io::Result<PathBuf> {
    if dest.join("manifest.json").exists() {
        return Ok(dest.to_path_buf());
    }
    let entries: Vec<fs::DirEntry> = fs::read_dir(dest)?.collect::<io::Result<_>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        return Ok(entries[0].path());
    }
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn limits() -> ArchiveLimits {
        ArchiveLimits {
            max_entries: 100,
            max_uncompressed_bytes: 1024 * 1024,
        }
    }

    fn build_zip(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("package.zip");
        let mut writer = ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_entry_name_checks() {
        assert!(check_entry_name("detector.py").is_none());
        assert!(check_entry_name("pkg/models/weights.bin").is_none());
        assert!(check_entry_name("../evil.py").is_some());
        assert!(check_entry_name("pkg/../../evil.py").is_some());
        assert!(check_entry_name("pkg\\..\\evil.py").is_some());
        assert!(check_entry_name("/etc/cron.d/evil").is_some());
        assert!(check_entry_name("C:\\evil.py").is_some());
        assert!(check_entry_name("..data/ok.py").is_none());
    }

    #[test]
    fn test_traversal_rejected_before_any_write() {
        let work = TempDir::new().unwrap();
        let archive = build_zip(
            work.path(),
            &[
                ("manifest.json", b"{}"),
                ("detector.py", b"print('hi')"),
                ("../escaped.txt", b"owned"),
            ],
        );
        let dest = work.path().join("out");

        let err = extract_package(&archive, &dest, limits()).unwrap_err();
        assert!(matches!(err, DetectorError::SecurityViolation { .. }));
        assert!(err.to_string().contains("path traversal"));
        assert!(!dest.exists());
        assert!(!work.path().join("escaped.txt").exists());
    }

    #[test]
    fn test_entry_count_limit() {
        let work = TempDir::new().unwrap();
        let archive = build_zip(work.path(), &[("a", b"1"), ("b", b"2"), ("c", b"3")]);
        let tight = ArchiveLimits {
            max_entries: 2,
            ..limits()
        };
        assert!(extract_package(&archive, &work.path().join("out"), tight).is_err());
    }

    #[test]
    fn test_size_limit() {
        let work = TempDir::new().unwrap();
        let big = vec![0u8; 4096];
        let archive = build_zip(work.path(), &[("weights.bin", &big)]);
        let tight = ArchiveLimits {
            max_uncompressed_bytes: 1024,
            ..limits()
        };
        let err = extract_package(&archive, &work.path().join("out"), tight).unwrap_err();
        assert!(err.to_string().contains("limit 1024"));
    }

    #[test]
    fn test_single_top_level_directory_unwrapped() {
        let work = TempDir::new().unwrap();
        let archive = build_zip(
            work.path(),
            &[
                ("lighting/manifest.json", b"{}"),
                ("lighting/detector.py", b"pass"),
            ],
        );
        let dest = work.path().join("out");
        let root = extract_package(&archive, &dest, limits()).unwrap();
        assert_eq!(root, dest.join("lighting"));
        assert!(root.join("detector.py").is_file());
    }

    #[test]
    fn test_flat_archive_root() {
        let work = TempDir::new().unwrap();
        let archive = build_zip(
            work.path(),
            &[("manifest.json", b"{}"), ("lib/util.py", b"pass")],
        );
        let dest = work.path().join("out");
        let root = extract_package(&archive, &dest, limits()).unwrap();
        assert_eq!(root, dest);
        assert!(root.join("lib/util.py").is_file());
    }
}
