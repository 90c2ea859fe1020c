//! Configuration for the detector host
//!
//! Bootstrap configuration is a TOML file (`cmon-dh.toml`). Every section is
//! optional; missing values fall back to the built-in defaults below.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (`--root-folder`, `--config`)
//! 2. Environment variables (`CMON_ROOT_FOLDER`, `CMON_DH_CONFIG`)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)
//!
//! Resource limits for detector containers are deliberately **not** set here:
//! they are unset unless a detector's manifest requests them, favouring heavy
//! research workloads over strict ceilings.

use cmon_common::config::{LoggingConfig, RootFolderResolver};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service name used for config file and root folder resolution
pub const SERVICE_NAME: &str = "cmon-dh";

/// Complete bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Root folder for registry, packages, backups and communication dirs
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
    pub channel: ChannelConfig,
    pub manager: ManagerConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub aggregation: AggregationConfig,
    pub installer: InstallerConfig,
}

impl HostConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> cmon_common::Result<Self> {
        cmon_common::config::load_toml_config(path)
    }

    /// Resolve the on-disk layout, applying the root folder priority order
    pub fn resolve_paths(&self, cli_root: Option<PathBuf>) -> HostPaths {
        let root = RootFolderResolver::new(SERVICE_NAME)
            .with_cli_arg(cli_root)
            .with_toml_value(self.root_folder.clone())
            .resolve();
        HostPaths::new(root)
    }
}

/// On-disk layout under the root folder
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub root: PathBuf,
    /// Installed detector packages (`detectors/<name>/`)
    pub detectors_dir: PathBuf,
    /// Pre-overwrite snapshots (`backups/<name>/<version>-<timestamp>/`)
    pub backups_dir: PathBuf,
    /// Temporary extraction area for packages being installed
    pub staging_dir: PathBuf,
    /// Ephemeral per-detector communication directories
    pub comm_dir: PathBuf,
    /// Captured frames (`frames/<take_id>/<frame_id>.png`)
    pub frames_dir: PathBuf,
    /// Persistent detector registry
    pub registry_path: PathBuf,
    /// Seccomp allow-list passed to every detector container
    pub seccomp_profile_path: PathBuf,
}

impl HostPaths {
    pub fn new(root: PathBuf) -> Self {
        Self {
            detectors_dir: root.join("detectors"),
            backups_dir: root.join("backups"),
            staging_dir: root.join("staging"),
            comm_dir: root.join("comm"),
            frames_dir: root.join("frames"),
            registry_path: root.join("registry.json"),
            seccomp_profile_path: root.join("seccomp").join("detector.json"),
            root,
        }
    }

    /// Create every directory of the layout
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.root,
            &self.detectors_dir,
            &self.backups_dir,
            &self.staging_dir,
            &self.comm_dir,
            &self.frames_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = self.seccomp_profile_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Container engine adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker CLI binary
    pub docker_binary: String,
    /// Engine API socket, used for raw container statistics
    pub engine_socket: PathBuf,
    /// Timeout for ordinary engine commands
    pub command_timeout_secs: u64,
    /// Timeout for image builds
    pub build_timeout_secs: u64,
    /// Grace period before a stopping container is killed
    pub stop_timeout_secs: u64,
    /// Base images detector packages may build from (`repository:tag`)
    pub allowed_base_images: Vec<String>,
    /// Size of the tmpfs mounted at `/tmp`
    pub tmpfs_tmp_size: String,
    /// Size of the tmpfs mounted at `/dev/shm`
    pub tmpfs_shm_size: String,
    /// Image repository prefix for built detector images
    pub image_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            engine_socket: PathBuf::from("/var/run/docker.sock"),
            command_timeout_secs: 30,
            build_timeout_secs: 900,
            stop_timeout_secs: 10,
            allowed_base_images: vec![
                "python:3.10-slim".to_string(),
                "python:3.11-slim".to_string(),
                "python:3.12-slim".to_string(),
                "pytorch/pytorch:2.1.0-cuda12.1-cudnn8-runtime".to_string(),
                "nvidia/cuda:12.1.0-runtime-ubuntu22.04".to_string(),
            ],
            tmpfs_tmp_size: "1g".to_string(),
            tmpfs_shm_size: "2g".to_string(),
            image_prefix: "cmon-detector".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Filesystem channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Pending requests older than this are purged and reported as timeouts
    pub request_timeout_secs: u64,
    /// Interval between scans of the output directory
    pub poll_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            poll_interval_ms: 100,
        }
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Process manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Interval between container liveness checks
    pub liveness_interval_secs: u64,
    /// Consecutive liveness failures before the detector enters `error`
    pub max_liveness_failures: u32,
    /// Bound on joining a communication loop during stop
    pub loop_join_timeout_secs: u64,
    /// Aggregate bound on stopping every detector at shutdown
    pub shutdown_timeout_secs: u64,
    /// Depth of each detector's outbound job queue
    pub outbound_queue_depth: usize,
    pub recovery: RecoveryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            liveness_interval_secs: 5,
            max_liveness_failures: 3,
            loop_join_timeout_secs: 5,
            shutdown_timeout_secs: 30,
            outbound_queue_depth: 64,
            recovery: RecoveryConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn loop_join_timeout(&self) -> Duration {
        Duration::from_secs(self.loop_join_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Automatic stop+start of detectors that entered `error`
///
/// Disabled by default; operators recover detectors explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Maximum restarts inside `window_secs`
    pub max_restarts: u32,
    pub window_secs: u64,
    /// Delay between the error and the restart attempt
    pub backoff_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_restarts: 3,
            window_secs: 600,
            backoff_secs: 5,
        }
    }
}

/// Frame-pair scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard capacity of each detector's queue
    pub queue_capacity: usize,
    /// Fill level above which low-priority jobs may be shed
    pub high_water_mark: usize,
    /// Frames within this distance of a take's start or end are boundary frames
    pub boundary_window: u32,
    /// Upper bound on probabilistically dropped submissions
    pub max_drop_ratio: f64,
    /// Concurrent container round-trips per detector
    pub max_in_flight_per_detector: usize,
    /// Starting point of the adaptive result timeout
    pub initial_timeout_secs: u64,
    /// Ceiling of the adaptive result timeout
    pub max_timeout_secs: u64,
    /// Number of recent latencies considered
    pub latency_window: usize,
    /// Minimum samples before the timeout adapts
    pub latency_min_samples: usize,
    /// Multiplier applied to the p95 latency
    pub timeout_multiplier: f64,
    /// Frame count assumed for takes whose length is unknown
    pub estimated_frames_per_take: i64,
    /// Fixed RNG seed for load shedding (tests and reproducible runs)
    pub drop_seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            high_water_mark: 192,
            boundary_window: 10,
            max_drop_ratio: 0.5,
            max_in_flight_per_detector: 4,
            initial_timeout_secs: 30,
            max_timeout_secs: 300,
            latency_window: 50,
            latency_min_samples: 5,
            timeout_multiplier: 2.0,
            estimated_frames_per_take: 300,
            drop_seed: None,
        }
    }
}

impl SchedulerConfig {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs.max(self.initial_timeout_secs))
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Entries kept per take before the oldest are evicted
    pub max_entries_per_take: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries_per_take: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Error grouping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Largest frame-id gap still treated as one contiguous occurrence
    pub max_frame_gap: i64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { max_frame_gap: 1 }
    }
}

/// Package installer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Maximum number of entries in a package archive
    pub max_archive_entries: usize,
    /// Maximum total uncompressed size of a package archive
    pub max_uncompressed_bytes: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            max_archive_entries: 2_000,
            max_uncompressed_bytes: 512 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: HostConfig = toml::from_str("").unwrap();
        assert_eq!(config.channel.request_timeout_secs, 60);
        assert_eq!(config.manager.max_liveness_failures, 3);
        assert_eq!(config.scheduler.boundary_window, 10);
        assert_eq!(config.cache.ttl_secs, 300);
        assert!(!config.manager.recovery.enabled);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            root_folder = "/srv/cmon"

            [scheduler]
            queue_capacity = 32
            high_water_mark = 24

            [manager.recovery]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/cmon")));
        assert_eq!(config.scheduler.queue_capacity, 32);
        assert_eq!(config.scheduler.max_in_flight_per_detector, 4);
        assert!(config.manager.recovery.enabled);
        assert_eq!(config.manager.recovery.max_restarts, 3);
    }

    #[test]
    fn test_paths_layout() {
        let paths = HostPaths::new(PathBuf::from("/data/cmon"));
        assert_eq!(paths.registry_path, PathBuf::from("/data/cmon/registry.json"));
        assert_eq!(paths.detectors_dir, PathBuf::from("/data/cmon/detectors"));
        assert_eq!(
            paths.seccomp_profile_path,
            PathBuf::from("/data/cmon/seccomp/detector.json")
        );
    }

    #[test]
    fn test_max_timeout_never_below_initial() {
        let config = SchedulerConfig {
            initial_timeout_secs: 60,
            max_timeout_secs: 10,
            ..Default::default()
        };
        assert_eq!(config.max_timeout(), Duration::from_secs(60));
    }
}
