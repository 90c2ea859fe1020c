//! On-disk detector registry
//!
//! A single JSON document (`registry.json`) mapping detector name to its
//! installation record. Writers serialise through one async mutex and
//! replace the file with write-temp-then-rename; readers reload the file on
//! every call so external edits are picked up.

use crate::error::{DetectorError, Result};
use crate::models::DetectorVersion;
use chrono::{DateTime, Utc};
use cmon_common::config::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const REGISTRY_FORMAT: u32 = 1;

/// Registry entry for one installed detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledDetector {
    pub name: String,
    pub version: DetectorVersion,
    pub installed_at: DateTime<Utc>,
    /// SHA-256 over the package files
    pub checksum: String,
    pub image_ref: String,
    /// Active (started by `serve`, accepts work) vs disabled
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    format: u32,
    #[serde(default)]
    detectors: BTreeMap<String, InstalledDetector>,
}

/// File-backed registry
#[derive(Debug)]
pub struct DetectorRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DetectorRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<RegistryDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(RegistryDocument::default()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DetectorError::Configuration(format!(
                    "Registry {} is corrupt: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_document(&self, document: &mut RegistryDocument) -> Result<()> {
        document.format = REGISTRY_FORMAT;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(&*document)?;
        atomic_write(&self.path, &encoded)?;
        Ok(())
    }

    /// All installed detectors, sorted by name
    pub async fn list(&self) -> Result<Vec<InstalledDetector>> {
        Ok(self.read_document().await?.detectors.into_values().collect())
    }

    pub async fn get(&self, name: &str) -> Result<Option<InstalledDetector>> {
        Ok(self.read_document().await?.detectors.remove(name))
    }

    /// Insert or replace the entry for `entry.name`
    pub async fn upsert(&self, entry: InstalledDetector) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        document.detectors.insert(entry.name.clone(), entry);
        self.write_document(&mut document)
    }

    /// Remove and return the entry for `name`
    pub async fn remove(&self, name: &str) -> Result<Option<InstalledDetector>> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        let removed = document.detectors.remove(name);
        if removed.is_some() {
            self.write_document(&mut document)?;
        }
        Ok(removed)
    }

    /// Flip the enabled flag; returns the updated entry
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<InstalledDetector> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        let entry = document
            .detectors
            .get_mut(name)
            .ok_or_else(|| DetectorError::NotFound(format!("detector '{}'", name)))?;
        if entry.enabled == enabled {
            return Ok(entry.clone());
        }
        entry.enabled = enabled;
        let updated = entry.clone();
        self.write_document(&mut document)?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(name: &str, version: &str) -> InstalledDetector {
        InstalledDetector {
            name: name.to_string(),
            version: version.parse().unwrap(),
            installed_at: Utc::now(),
            checksum: "abc".to_string(),
            image_ref: format!("cmon-detector/{}:{}", name, version),
            enabled: false,
            description: String::new(),
            category: "general".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_registry() {
        let dir = TempDir::new().unwrap();
        let registry = DetectorRegistry::new(dir.path().join("registry.json"));
        assert!(registry.list().await.unwrap().is_empty());
        assert!(registry.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_set_enabled_remove() {
        let dir = TempDir::new().unwrap();
        let registry = DetectorRegistry::new(dir.path().join("registry.json"));

        registry.upsert(entry("props", "1.0.0")).await.unwrap();
        registry.upsert(entry("lighting", "2.1.0")).await.unwrap();
        let names: Vec<String> = registry.list().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["lighting", "props"]);

        let updated = registry.set_enabled("props", true).await.unwrap();
        assert!(updated.enabled);
        assert!(registry.get("props").await.unwrap().unwrap().enabled);

        assert!(matches!(
            registry.set_enabled("ghost", true).await,
            Err(DetectorError::NotFound(_))
        ));

        assert!(registry.remove("props").await.unwrap().is_some());
        assert!(registry.remove("props").await.unwrap().is_none());
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_readers_see_external_edits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let registry = DetectorRegistry::new(&path);
        registry.upsert(entry("props", "1.0.0")).await.unwrap();

        // Another process rewrites the file
        let other = DetectorRegistry::new(&path);
        other.upsert(entry("props", "1.1.0")).await.unwrap();

        let seen = registry.get("props").await.unwrap().unwrap();
        assert_eq!(seen.version.to_string(), "1.1.0");
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(DetectorRegistry::new(dir.path().join("registry.json")));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.spawn(async move { registry.upsert(entry(&format!("d{}", i), "1.0.0")).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(registry.list().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_corrupt_registry_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"{broken").unwrap();
        let registry = DetectorRegistry::new(&path);
        assert!(matches!(registry.list().await, Err(DetectorError::Configuration(_))));
    }
}
