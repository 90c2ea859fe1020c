//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration lives in a small TOML file per service. Runtime
//! state (detector registry, backups, communication directories) lives under
//! the resolved root folder.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "CMON_ROOT_FOLDER";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root folder resolution
///
/// Priority order:
/// 1. Command-line argument (highest priority)
/// 2. `CMON_ROOT_FOLDER` environment variable
/// 3. `root_folder` from the TOML config file
/// 4. OS-dependent compiled default (fallback)
#[derive(Debug, Clone)]
pub struct RootFolderResolver {
    service_name: String,
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            cli_arg: None,
            toml_value: None,
        }
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml_value(mut self, path: Option<PathBuf>) -> Self {
        self.toml_value = path;
        self
    }

    /// Resolve the root folder, logging which source won
    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            info!(service = %self.service_name, "Root folder: {} (from command line)", path.display());
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                info!(service = %self.service_name, "Root folder: {} (from {})", path, ROOT_FOLDER_ENV);
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            info!(service = %self.service_name, "Root folder: {} (from TOML config)", path.display());
            return path.clone();
        }

        let path = get_default_root_folder();
        info!(service = %self.service_name, "Root folder: {} (OS default)", path.display());
        path
    }
}

/// Get OS-dependent default root folder path
pub fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/cmon (or /var/lib/cmon for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("cmon"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/cmon"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("cmon"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/cmon"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("cmon"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\cmon"))
    } else {
        PathBuf::from("./cmon_data")
    }
}

/// Default location of a service's TOML file (`~/.config/cmon/<service>.toml`)
pub fn default_config_path(service_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cmon").join(format!("{}.toml", service_name)))
}

/// Load and parse a TOML configuration file
pub fn load_toml_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse TOML {}: {}", path.display(), e)))
}

/// Serialize a configuration value and write it atomically as TOML
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize TOML: {}", e)))?;
    atomic_write(path, content.as_bytes())
}

/// Replace `path` through a synced temp file and a rename, so readers see
/// either the old or the new content
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("Invalid file path: {}", path.display())))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let write_result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(Error::Io(e));
    }

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(Error::Io(e));
    }

    debug!(path = %path.display(), bytes = contents.len(), "Atomic write complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_default_log_level() {
        assert_eq!(LoggingConfig::default().level, "info");
        assert!(LoggingConfig::default().file.is_none());
    }

    #[test]
    #[serial]
    fn test_cli_arg_takes_priority() {
        std::env::set_var(ROOT_FOLDER_ENV, "/from/env");
        let resolved = RootFolderResolver::new("test")
            .with_cli_arg(Some(PathBuf::from("/from/cli")))
            .with_toml_value(Some(PathBuf::from("/from/toml")))
            .resolve();
        std::env::remove_var(ROOT_FOLDER_ENV);
        assert_eq!(resolved, PathBuf::from("/from/cli"));
    }

    #[test]
    #[serial]
    fn test_env_beats_toml() {
        std::env::set_var(ROOT_FOLDER_ENV, "/from/env");
        let resolved = RootFolderResolver::new("test")
            .with_toml_value(Some(PathBuf::from("/from/toml")))
            .resolve();
        std::env::remove_var(ROOT_FOLDER_ENV);
        assert_eq!(resolved, PathBuf::from("/from/env"));
    }

    #[test]
    #[serial]
    fn test_toml_then_default() {
        std::env::remove_var(ROOT_FOLDER_ENV);
        let resolved = RootFolderResolver::new("test")
            .with_toml_value(Some(PathBuf::from("/from/toml")))
            .resolve();
        assert_eq!(resolved, PathBuf::from("/from/toml"));

        let fallback = RootFolderResolver::new("test").resolve();
        assert_eq!(fallback, get_default_root_folder());
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        // No temporary files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sample.toml");
        let sample = Sample {
            name: "detector-host".to_string(),
            count: 3,
        };

        write_toml_config(&sample, &path).unwrap();
        let loaded: Sample = load_toml_config(&path).unwrap();
        assert_eq!(loaded, sample);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let result: Result<Sample> = load_toml_config(Path::new("/nonexistent/cmon.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
