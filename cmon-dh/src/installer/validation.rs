//! Package layout validation and checksums

use crate::error::{DetectorError, Result};
use crate::models::DetectorManifest;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "manifest.json";

/// All regular files under `root`, relative, sorted
///
/// Symlinks are neither followed nor listed.
pub fn package_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Validate an extracted package and return its manifest
///
/// Exactly one `manifest.json` is allowed and it must sit at the package
/// root; the manifest's entry point must exist.
pub fn validate_package(root: &Path) -> Result<DetectorManifest> {
    let manifests: Vec<PathBuf> = package_files(root)?
        .into_iter()
        .filter(|p| p.file_name().map(|n| n == MANIFEST_FILE).unwrap_or(false))
        .collect();

    match manifests.as_slice() {
        [] => {
            return Err(DetectorError::Configuration(
                "Package has no manifest.json".to_string(),
            ))
        }
        [only] if only == Path::new(MANIFEST_FILE) => {}
        [only] => {
            return Err(DetectorError::Configuration(format!(
                "manifest.json must be at the package root, found {}",
                only.display()
            )))
        }
        many => {
            return Err(DetectorError::Configuration(format!(
                "Package has {} manifest files; exactly one is allowed",
                many.len()
            )))
        }
    }

    let raw = fs::read_to_string(root.join(MANIFEST_FILE))?;
    let manifest = DetectorManifest::from_json(&raw)?;

    if !root.join(&manifest.entry_point).is_file() {
        return Err(DetectorError::Configuration(format!(
            "Entry point '{}' not found in package",
            manifest.entry_point
        )));
    }
    Ok(manifest)
}

/// SHA-256 over every file's relative path and contents, in path order
pub fn package_checksum(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for relative in package_files(root)? {
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(root.join(&relative))?);
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{"name":"props","version":"1.0.0","description":"d","author":"a"}"#;

    fn package(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, body) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        dir
    }

    #[test]
    fn test_valid_package() {
        let dir = package(&[("manifest.json", MANIFEST), ("detector.py", "pass")]);
        let manifest = validate_package(dir.path()).unwrap();
        assert_eq!(manifest.name, "props");
    }

    #[test]
    fn test_manifest_count_and_location() {
        let none = package(&[("detector.py", "pass")]);
        assert!(validate_package(none.path()).unwrap_err().to_string().contains("no manifest"));

        let nested = package(&[("sub/manifest.json", MANIFEST), ("detector.py", "pass")]);
        assert!(validate_package(nested.path()).is_err());

        let two = package(&[
            ("manifest.json", MANIFEST),
            ("vendor/manifest.json", MANIFEST),
            ("detector.py", "pass"),
        ]);
        assert!(validate_package(two.path()).unwrap_err().to_string().contains("exactly one"));
    }

    #[test]
    fn test_package_files_lists_nested_files_in_order() {
        let dir = package(&[
            ("manifest.json", MANIFEST),
            ("detector.py", "pass"),
            ("lib/util/geometry.py", "pass"),
            ("lib/__init__.py", ""),
        ]);
        #[cfg(unix)]
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("lib/passwd")).unwrap();

        let files = package_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("detector.py"),
                PathBuf::from("lib/__init__.py"),
                PathBuf::from("lib/util/geometry.py"),
                PathBuf::from("manifest.json"),
            ]
        );
    }

    #[test]
    fn test_missing_entry_point() {
        let dir = package(&[("manifest.json", MANIFEST)]);
        assert!(validate_package(dir.path())
            .unwrap_err()
            .to_string()
            .contains("detector.py"));
    }

    #[test]
    fn test_checksum_covers_names_and_contents() {
        let a = package(&[("manifest.json", MANIFEST), ("detector.py", "pass")]);
        let b = package(&[("manifest.json", MANIFEST), ("detector.py", "pass")]);
        let c = package(&[("manifest.json", MANIFEST), ("detector.py", "pass ")]);
        let d = package(&[("manifest.json", MANIFEST), ("main.py", "pass")]);

        let sum_a = package_checksum(a.path()).unwrap();
        assert_eq!(sum_a.len(), 64);
        assert_eq!(sum_a, package_checksum(b.path()).unwrap());
        assert_ne!(sum_a, package_checksum(c.path()).unwrap());
        assert_ne!(sum_a, package_checksum(d.path()).unwrap());
    }
}
