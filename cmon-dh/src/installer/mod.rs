//! Detector installer
//!
//! Gatekeeps what code may run as a detector. An install moves a package
//! through `validating -> security-scanned -> built -> registered`; any
//! failure rolls back every filesystem change made by that call.
//!
//! Layout under the root folder:
//!
//! ```text
//! staging/<uuid>/                         extraction scratch space
//! detectors/<name>/                       installed package (build context)
//! backups/<name>/<version>-<timestamp>/   snapshots of replaced installs
//! registry.json                           installation records
//! ```

pub mod archive;
pub mod registry;
pub mod security_scan;
pub mod validation;

pub use registry::{DetectorRegistry, InstalledDetector};
pub use security_scan::{ScanIssue, SecurityScanner};

use crate::config::{HostPaths, InstallerConfig, RuntimeConfig};
use crate::error::{DetectorError, Result};
use crate::models::{validate_detector_name, DetectorManifest, DetectorVersion};
use crate::runtime::{build_detector_image, ContainerRuntime};
use archive::ArchiveLimits;
use chrono::{DateTime, NaiveDateTime, Utc};
use cmon_common::events::{CmonEvent, EventBus, InstallStage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

/// Successful install
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub detector: InstalledDetector,
    /// Snapshot of the replaced installation, if there was one
    pub backup: Option<PathBuf>,
    pub message: String,
    pub build_log: String,
}

/// Outcome of an uninstall cascade
#[derive(Debug, Clone, Default)]
pub struct UninstallReport {
    pub name: String,
    /// Registry entry was present and is now gone
    pub removed: bool,
    /// Cascade steps that failed but did not stop the uninstall
    pub warnings: Vec<String>,
}

/// One backup snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub version: String,
    pub created_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

/// Package installer
pub struct DetectorInstaller {
    paths: HostPaths,
    config: InstallerConfig,
    runtime_config: RuntimeConfig,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<DetectorRegistry>,
    scanner: SecurityScanner,
    events: EventBus,
    /// One install or uninstall at a time
    install_lock: Mutex<()>,
}

impl DetectorInstaller {
    pub fn new(
        paths: HostPaths,
        config: InstallerConfig,
        runtime_config: RuntimeConfig,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<DetectorRegistry>,
        events: EventBus,
    ) -> Self {
        let scanner = SecurityScanner::new(runtime_config.allowed_base_images.clone());
        Self {
            paths,
            config,
            runtime_config,
            runtime,
            registry,
            scanner,
            events,
            install_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<DetectorRegistry> {
        &self.registry
    }

    /// Installed package directory for `name`
    pub fn detector_dir(&self, name: &str) -> PathBuf {
        self.paths.detectors_dir.join(name)
    }

    /// Manifest of an installed detector
    pub async fn installed_manifest(&self, name: &str) -> Result<DetectorManifest> {
        validate_detector_name(name)?;
        let path = self.detector_dir(name).join(validation::MANIFEST_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DetectorError::NotFound(format!("detector '{}' is not installed", name)))
            }
            Err(e) => return Err(e.into()),
        };
        DetectorManifest::from_json(&raw)
    }

    fn progress(&self, name: Option<&str>, stage: InstallStage) {
        self.events.emit_lossy(CmonEvent::InstallProgress {
            name: name.map(str::to_string),
            stage,
            timestamp: Utc::now(),
        });
    }

    /// Install a detector package archive
    ///
    /// **Algorithm:**
    /// 1. Fail fast when the container engine is unavailable
    /// 2. Extract into `staging/<uuid>` (path-traversal guard runs first)
    /// 3. Validate the package layout and manifest
    /// 4. Static security scan; any finding fails the install
    /// 5. Version check: the new version must be strictly greater than the
    ///    installed one unless `force`
    /// 6. Build the hardened image from the staged package
    /// 7. Snapshot the existing install to `backups/`, move the staged
    ///    package into `detectors/<name>`, update the registry
    ///
    /// Steps 2-6 only touch the staging directory, so a failure there is
    /// rolled back by deleting it. Failures in step 7 restore the snapshot
    /// and remove the freshly built image.
    pub async fn install(&self, archive_path: &Path, force: bool) -> Result<InstallOutcome> {
        self.runtime.ensure_available()?;
        let _guard = self.install_lock.lock().await;

        let staging = self.paths.staging_dir.join(Uuid::new_v4().to_string());
        let result = self.install_staged(archive_path, &staging, force).await;
        if let Err(e) = remove_tree(&staging).await {
            warn!(path = %staging.display(), error = %e, "Failed to clean staging directory");
        }

        match &result {
            Ok(outcome) => info!(
                detector = %outcome.detector.name,
                version = %outcome.detector.version,
                image = %outcome.detector.image_ref,
                "Detector installed"
            ),
            Err(e) => warn!(archive = %archive_path.display(), error = %e, "Detector install failed"),
        }
        result
    }

    async fn install_staged(&self, archive_path: &Path, staging: &Path, force: bool) -> Result<InstallOutcome> {
        self.progress(None, InstallStage::Validating);

        let limits = ArchiveLimits {
            max_entries: self.config.max_archive_entries,
            max_uncompressed_bytes: self.config.max_uncompressed_bytes,
        };
        let package_root = {
            let archive_path = archive_path.to_path_buf();
            let staging = staging.to_path_buf();
            tokio::task::spawn_blocking(move || archive::extract_package(&archive_path, &staging, limits))
                .await
                .map_err(|e| DetectorError::Internal(format!("extraction task failed: {}", e)))??
        };

        let manifest = validation::validate_package(&package_root)?;
        let name = manifest.name.clone();
        self.progress(Some(&name), InstallStage::Validating);

        let issues = self.scanner.scan_package(&package_root)?;
        if !issues.is_empty() {
            return Err(DetectorError::security(
                format!("security scan of '{}' failed with {} issue(s)", name, issues.len()),
                issues.iter().map(ToString::to_string).collect(),
            ));
        }
        self.progress(Some(&name), InstallStage::SecurityScanned);

        let existing = self.registry.get(&name).await?;
        if let Some(current) = &existing {
            check_upgrade(&name, &current.version, &manifest.version, force)?;
        }

        let checksum = {
            let root = package_root.clone();
            tokio::task::spawn_blocking(move || validation::package_checksum(&root))
                .await
                .map_err(|e| DetectorError::Internal(format!("checksum task failed: {}", e)))??
        };

        let build = build_detector_image(self.runtime.as_ref(), &package_root, &manifest, &self.runtime_config).await?;
        self.progress(Some(&name), InstallStage::Built);

        let entry = InstalledDetector {
            name: name.clone(),
            version: manifest.version,
            installed_at: Utc::now(),
            checksum,
            image_ref: build.image_ref.clone(),
            enabled: existing.as_ref().map(|e| e.enabled).unwrap_or(false),
            description: manifest.description.clone(),
            category: manifest.category.clone(),
        };
        let backup = match self.activate(&package_root, &entry, existing.as_ref()).await {
            Ok(backup) => backup,
            Err(e) => {
                // The previous version may share the reference on a forced reinstall
                let replaced = existing.as_ref().map(|previous| previous.image_ref.as_str());
                if replaced != Some(build.image_ref.as_str()) {
                    if let Err(remove_err) = self.runtime.remove_image(&build.image_ref).await {
                        warn!(image = %build.image_ref, error = %remove_err, "Rollback could not remove new image");
                    }
                }
                return Err(e);
            }
        };
        self.progress(Some(&name), InstallStage::Registered);

        self.events.emit_lossy(CmonEvent::DetectorInstalled {
            name: name.clone(),
            version: entry.version.to_string(),
            image_ref: entry.image_ref.clone(),
            timestamp: Utc::now(),
        });

        let message = match &existing {
            Some(previous) => format!(
                "Detector '{}' upgraded from {} to {}",
                name, previous.version, entry.version
            ),
            None => format!("Detector '{}' {} installed", name, entry.version),
        };
        Ok(InstallOutcome {
            detector: entry,
            backup,
            message,
            build_log: build.log,
        })
    }

    /// Swap the staged package into place and register it
    ///
    /// Any failure restores the previous install; returns the backup path.
    async fn activate(
        &self,
        package_root: &Path,
        entry: &InstalledDetector,
        existing: Option<&InstalledDetector>,
    ) -> Result<Option<PathBuf>> {
        let target = self.detector_dir(&entry.name);
        let backup = match (existing, target.exists()) {
            (_, false) => None,
            (Some(current), true) => Some(self.snapshot(&entry.name, &current.version.to_string(), &target).await?),
            (None, true) => Some(self.snapshot(&entry.name, "unregistered", &target).await?),
        };

        if let Err(e) = move_dir(package_root, &target).await {
            self.restore(&target, backup.as_deref()).await;
            return Err(e.into());
        }
        if let Err(e) = self.registry.upsert(entry.clone()).await {
            self.restore(&target, backup.as_deref()).await;
            return Err(e);
        }
        Ok(backup)
    }

    /// Move the current install into `backups/<name>/<version>-<timestamp>`
    async fn snapshot(&self, name: &str, version: &str, target: &Path) -> Result<PathBuf> {
        let backup = self
            .paths
            .backups_dir
            .join(name)
            .join(format!("{}-{}", version, Utc::now().format(BACKUP_TIMESTAMP_FORMAT)));
        if let Some(parent) = backup.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_dir(target, &backup).await?;
        info!(detector = %name, backup = %backup.display(), "Previous installation backed up");
        Ok(backup)
    }

    /// Undo a partially applied swap
    async fn restore(&self, target: &Path, backup: Option<&Path>) {
        if let Err(e) = remove_tree(target).await {
            warn!(path = %target.display(), error = %e, "Rollback could not remove new install");
        }
        if let Some(backup) = backup {
            if let Err(e) = move_dir(backup, target).await {
                warn!(backup = %backup.display(), error = %e, "Rollback could not restore backup");
            }
        }
    }

    /// Backups of `name`, oldest first
    pub async fn list_backups(&self, name: &str) -> Result<Vec<BackupEntry>> {
        validate_detector_name(name)?;
        let dir = self.paths.backups_dir.join(name);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let (version, created_at) = match dir_name.rsplit_once('-') {
                Some((version, stamp)) => (
                    version.to_string(),
                    NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT)
                        .ok()
                        .map(|naive| naive.and_utc()),
                ),
                None => (dir_name.clone(), None),
            };
            backups.push(BackupEntry {
                version,
                created_at,
                path: entry.path(),
            });
        }
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.path.cmp(&b.path)));
        Ok(backups)
    }

    /// Remove a detector: containers, images, files and registry entry
    ///
    /// Best effort: every step runs even if an earlier one failed, and
    /// failures come back as warnings. The registry entry is always removed
    /// when possible so the detector disappears for operators.
    pub async fn uninstall(&self, name: &str) -> Result<UninstallReport> {
        validate_detector_name(name)?;
        let _guard = self.install_lock.lock().await;

        let entry = self.registry.get(name).await?;
        let dir = self.detector_dir(name);
        if entry.is_none() && !dir.exists() {
            return Err(DetectorError::NotFound(format!("detector '{}' is not installed", name)));
        }

        let mut report = UninstallReport {
            name: name.to_string(),
            ..Default::default()
        };

        match self.runtime.ensure_available() {
            Ok(()) => {
                if let Err(e) = self.runtime.remove_detector_containers(name).await {
                    report.warnings.push(format!("container removal failed: {}", e));
                }
                let repository = format!("{}/{}", self.runtime_config.image_prefix, name.to_ascii_lowercase());
                match self.runtime.remove_images(&repository).await {
                    Ok(removed) => info!(detector = %name, images = ?removed, "Detector images removed"),
                    Err(e) => report.warnings.push(format!("image removal failed: {}", e)),
                }
            }
            Err(e) => report
                .warnings
                .push(format!("containers and images not removed: {}", e)),
        }

        if dir.exists() {
            if let Err(e) = remove_tree(&dir).await {
                report
                    .warnings
                    .push(format!("could not delete {}: {}", dir.display(), e));
            }
        }

        match self.registry.remove(name).await {
            Ok(removed) => report.removed = removed.is_some(),
            Err(e) => report.warnings.push(format!("registry update failed: {}", e)),
        }

        for warning in &report.warnings {
            warn!(detector = %name, warning = %warning, "Uninstall step failed");
        }
        self.events.emit_lossy(CmonEvent::DetectorUninstalled {
            name: name.to_string(),
            warnings: report.warnings.clone(),
            timestamp: Utc::now(),
        });
        Ok(report)
    }
}

fn check_upgrade(name: &str, installed: &DetectorVersion, incoming: &DetectorVersion, force: bool) -> Result<()> {
    if incoming > installed || force {
        return Ok(());
    }
    Err(DetectorError::Configuration(format!(
        "Detector '{}' {} is already installed; version {} is not newer (use force to reinstall)",
        name, installed, incoming
    )))
}

async fn move_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(from, to).await
}

/// Recursive delete; retries once after making everything writable
pub(crate) async fn remove_tree(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(first) => {
            let root = path.to_path_buf();
            tokio::task::spawn_blocking(move || make_writable(&root))
                .await
                .map_err(std::io::Error::other)??;
            tokio::fs::remove_dir_all(path).await.map_err(|second| {
                std::io::Error::new(second.kind(), format!("{} (first attempt: {})", second, first))
            })
        }
    }
}

/// Grant the owner write access throughout `path`
///
/// Directories are fixed as they are reached, before the walk descends.
fn make_writable(path: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if entry.path_is_symlink() {
            continue;
        }
        let metadata = entry.metadata()?;
        let mut permissions = metadata.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let extra = if metadata.is_dir() { 0o700 } else { 0o600 };
            permissions.set_mode(permissions.mode() | extra);
        }
        #[cfg(not(unix))]
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        std::fs::set_permissions(entry.path(), permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_rules() {
        let v = |s: &str| s.parse::<DetectorVersion>().unwrap();
        assert!(check_upgrade("d", &v("1.0.0"), &v("1.1.0"), false).is_ok());
        assert!(check_upgrade("d", &v("1.0.0"), &v("1.0.0"), false).is_err());
        assert!(check_upgrade("d", &v("1.0.0"), &v("0.9.0"), false).is_err());
        assert!(check_upgrade("d", &v("1.0.0"), &v("0.9.0"), true).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_tree_handles_read_only_files() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("pkg");
        std::fs::create_dir_all(target.join("sub")).unwrap();
        std::fs::write(target.join("sub/file.py"), "pass").unwrap();
        std::fs::set_permissions(target.join("sub"), std::fs::Permissions::from_mode(0o500)).unwrap();

        remove_tree(&target).await.unwrap();
        assert!(!target.exists());
        // Missing tree is fine
        remove_tree(&target).await.unwrap();
    }
}
