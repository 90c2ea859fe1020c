//! Process/container manager
//!
//! Supervises the running detector containers. Each detector gets:
//!
//! - a fresh communication directory `comm/<name>-<id>/{input,output}`
//!   (mode 0700, config in `config.json`)
//! - one hardened container with that directory as its only mount
//! - one communication loop task, cancelled through its own token
//!
//! ```text
//! stopped -> starting -> running <-> degraded -> stopping -> stopped
//!                        running -> error   (stop + start to recover)
//! ```
//!
//! A detector in `error` never affects the manager or other detectors.

mod detector;
mod process;
pub mod recovery;

pub use detector::{ContainerDetector, Detector, DetectorProvider, FrameAnalysis, FramePair};
pub use process::DetectorProcess;

use crate::channel::{SecureChannel, INPUT_DIR, OUTPUT_DIR};
use crate::config::{ChannelConfig, HostPaths, ManagerConfig, RuntimeConfig};
use crate::error::{DetectorError, Result};
use crate::installer::{remove_tree, DetectorInstaller};
use crate::models::validate_detector_name;
use crate::runtime::{build_detector_image, seccomp, ContainerRuntime, ContainerSpec, ContainerStats, ResourceLimits, SecurityProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmon_common::config::atomic_write;
use cmon_common::events::{EventBus, ProcessState};
use futures::future::join_all;
use process::{run_comm_loop, LoopSettings};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on delivering the shutdown message during stop
const SHUTDOWN_MESSAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Snapshot returned by [`ProcessManager::get_status`]
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub name: String,
    pub state: ProcessState,
    pub container_id: Option<String>,
    pub frame_count: u64,
    pub error_count: u64,
    pub pending_jobs: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub resource_stats: Option<ContainerStats>,
}

impl DetectorStatus {
    fn stopped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ProcessState::Stopped,
            container_id: None,
            frame_count: 0,
            error_count: 0,
            pending_jobs: 0,
            started_at: None,
            last_heartbeat: None,
            resource_stats: None,
        }
    }
}

/// Owner of every running detector
pub struct ProcessManager {
    runtime: Arc<dyn ContainerRuntime>,
    installer: Arc<DetectorInstaller>,
    paths: HostPaths,
    runtime_config: RuntimeConfig,
    channel_config: ChannelConfig,
    config: ManagerConfig,
    events: EventBus,
    processes: RwLock<HashMap<String, Arc<DetectorProcess>>>,
    /// Serialises start/stop per detector name
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProcessManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        installer: Arc<DetectorInstaller>,
        paths: HostPaths,
        runtime_config: RuntimeConfig,
        channel_config: ChannelConfig,
        config: ManagerConfig,
        events: EventBus,
    ) -> Self {
        Self {
            runtime,
            installer,
            paths,
            runtime_config,
            channel_config,
            config,
            events,
            processes: RwLock::new(HashMap::new()),
            name_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.name_locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Running process for `name`
    pub async fn process(&self, name: &str) -> Option<Arc<DetectorProcess>> {
        self.processes.read().await.get(name).cloned()
    }

    /// Names of detectors with a live process, sorted
    pub async fn running_detectors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start `name` with `config`
    ///
    /// Idempotent: a detector that is already starting, running or
    /// degraded is returned as is. A detector in `error` must be stopped
    /// first.
    ///
    /// **Algorithm:**
    /// 1. Check engine availability and resolve `config` against the
    ///    manifest schema
    /// 2. Build the image if the engine no longer has it
    /// 3. Create the communication directory and write `config.json`
    /// 4. Run the container, open the channel, spawn the loop
    pub async fn start_detector(&self, name: &str, config: &Map<String, Value>) -> Result<Arc<DetectorProcess>> {
        validate_detector_name(name)?;
        self.runtime.ensure_available()?;

        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.process(name).await {
            return match existing.state() {
                ProcessState::Error => Err(DetectorError::process(
                    name,
                    "detector is in error state; stop it before starting again",
                )),
                _ => {
                    debug!(detector = %name, "Detector already running");
                    Ok(existing)
                }
            };
        }

        let entry = self
            .installer
            .registry()
            .get(name)
            .await?
            .ok_or_else(|| DetectorError::NotFound(format!("detector '{}' is not installed", name)))?;
        let manifest = self.installer.installed_manifest(name).await?;
        let resolved = manifest.schema.resolve(config)?;

        if !self.runtime.image_exists(&entry.image_ref).await? {
            info!(detector = %name, image = %entry.image_ref, "Image missing; rebuilding");
            build_detector_image(
                self.runtime.as_ref(),
                &self.installer.detector_dir(name),
                &manifest,
                &self.runtime_config,
            )
            .await?;
        }

        if !self.paths.seccomp_profile_path.exists() {
            seccomp::write_profile(&self.paths.seccomp_profile_path)?;
        }

        let instance = Uuid::new_v4().simple().to_string();
        let comm_dir = self.paths.comm_dir.join(format!("{}-{}", name, &instance[..8]));
        let user = match prepare_comm_dir(&comm_dir, &resolved).await {
            Ok(user) => user,
            Err(e) => {
                let _ = remove_tree(&comm_dir).await;
                return Err(e);
            }
        };

        let spec = ContainerSpec {
            detector_name: name.to_string(),
            container_name: format!("cmon-{}-{}", name.to_ascii_lowercase(), &instance[..12]),
            image_ref: entry.image_ref.clone(),
            comm_dir: comm_dir.clone(),
            security: SecurityProfile {
                seccomp_profile: Some(self.paths.seccomp_profile_path.clone()),
                extra_capabilities: manifest.docker.extra_capabilities.clone(),
                gpu_enabled: manifest.docker.gpu_enabled,
                tmpfs_tmp_size: self.runtime_config.tmpfs_tmp_size.clone(),
                tmpfs_shm_size: self.runtime_config.tmpfs_shm_size.clone(),
                user,
            },
            limits: ResourceLimits::from_manifest(&manifest),
        };

        let container = match self.runtime.run(&spec).await {
            Ok(container) => container,
            Err(e) => {
                let _ = remove_tree(&comm_dir).await;
                warn!(detector = %name, error = %e, "Failed to start detector container");
                return Err(e.into());
            }
        };

        let channel = match SecureChannel::open(name, &comm_dir, self.channel_config.request_timeout()) {
            Ok(channel) => channel,
            Err(e) => {
                let _ = self.runtime.remove(&container).await;
                let _ = remove_tree(&comm_dir).await;
                return Err(e.into());
            }
        };

        let (outbound, jobs) = mpsc::channel(self.config.outbound_queue_depth.max(1));
        let process = Arc::new(DetectorProcess::new(
            name.to_string(),
            container,
            comm_dir,
            resolved,
            outbound,
            self.events.clone(),
        ));
        process.set_state(ProcessState::Starting, None);

        let settings = LoopSettings {
            poll_interval: self.channel_config.poll_interval(),
            liveness_interval: self.config.liveness_interval(),
            max_liveness_failures: self.config.max_liveness_failures.max(1),
        };
        let task = tokio::spawn(run_comm_loop(
            Arc::clone(&process),
            channel,
            Arc::clone(&self.runtime),
            jobs,
            settings,
        ));
        process.attach_loop(task).await;
        process.set_state(ProcessState::Running, None);

        self.processes
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&process));
        info!(
            detector = %name,
            container = %process.container().id,
            image = %process.container().image_ref,
            "Detector started"
        );
        Ok(process)
    }

    /// Stop `name`; returns false when it was not running
    ///
    /// **Algorithm:**
    /// 1. Deliver a shutdown message (bounded wait)
    /// 2. Cancel the loop and join it with a bounded timeout
    /// 3. Stop and remove the container
    /// 4. Delete the communication directory
    pub async fn stop_detector(&self, name: &str) -> Result<bool> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        let Some(process) = self.processes.write().await.remove(name) else {
            return Ok(false);
        };
        self.teardown(&process).await;
        Ok(true)
    }

    async fn teardown(&self, process: &Arc<DetectorProcess>) {
        let name = process.name().to_string();
        let previous = process.state();
        process.set_state(ProcessState::Stopping, None);

        if previous != ProcessState::Error {
            let detector = ContainerDetector::new(Arc::clone(process));
            match tokio::time::timeout(SHUTDOWN_MESSAGE_TIMEOUT, detector.cleanup()).await {
                Ok(Ok(())) => debug!(detector = %name, "Shutdown message delivered"),
                Ok(Err(e)) => debug!(detector = %name, error = %e, "Shutdown message not delivered"),
                Err(_) => debug!(detector = %name, "Shutdown message timed out"),
            }
        }

        process.join_loop(self.config.loop_join_timeout()).await;

        if self.runtime.availability().is_available() {
            if let Err(e) = self
                .runtime
                .stop(process.container(), self.runtime_config.stop_timeout())
                .await
            {
                warn!(detector = %name, error = %e, "Container stop failed; forcing removal");
            }
            if let Err(e) = self.runtime.remove(process.container()).await {
                warn!(detector = %name, error = %e, "Container removal failed");
            }
        }

        if let Err(e) = remove_tree(process.comm_dir()).await {
            warn!(detector = %name, path = %process.comm_dir().display(), error = %e, "Failed to delete communication directory");
        }

        process.set_state(ProcessState::Stopped, None);
        info!(detector = %name, "Detector stopped");
    }

    /// Status of `name`; stopped detectors report zeros
    pub async fn get_status(&self, name: &str) -> Result<DetectorStatus> {
        self.runtime.ensure_available()?;

        let Some(process) = self.process(name).await else {
            return match self.installer.registry().get(name).await? {
                Some(_) => Ok(DetectorStatus::stopped(name)),
                None => Err(DetectorError::NotFound(format!("detector '{}' is not installed", name))),
            };
        };

        let resource_stats = if process.state().accepts_work() {
            match self.runtime.stats(process.container()).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    debug!(detector = %name, error = %e, "Stats unavailable");
                    None
                }
            }
        } else {
            None
        };

        Ok(DetectorStatus {
            name: name.to_string(),
            state: process.state(),
            container_id: Some(process.container().id.clone()),
            frame_count: process.frame_count(),
            error_count: process.error_count(),
            pending_jobs: process.pending_jobs(),
            started_at: Some(process.started_at()),
            last_heartbeat: process.last_heartbeat(),
            resource_stats,
        })
    }

    /// Stop every detector concurrently within the shutdown timeout
    ///
    /// Detectors still stopping when the window closes have their loops
    /// aborted and their containers force-removed.
    pub async fn shutdown_all(&self) {
        let processes: Vec<Arc<DetectorProcess>> = self.processes.read().await.values().cloned().collect();
        if processes.is_empty() {
            return;
        }
        info!(detectors = processes.len(), "Stopping all detectors");

        let names: Vec<String> = processes.iter().map(|p| p.name().to_string()).collect();
        let stops = join_all(names.iter().map(|name| self.stop_detector(name)));
        if tokio::time::timeout(self.config.shutdown_timeout(), stops).await.is_ok() {
            return;
        }

        warn!("Shutdown window elapsed; force-removing remaining detectors");
        self.processes.write().await.clear();
        for process in processes {
            if process.state() == ProcessState::Stopped {
                continue;
            }
            process.join_loop(Duration::ZERO).await;
            if let Err(e) = self.runtime.remove(process.container()).await {
                warn!(detector = %process.name(), error = %e, "Forced container removal failed");
            }
            let _ = remove_tree(process.comm_dir()).await;
            process.set_state(ProcessState::Stopped, Some("forced shutdown".to_string()));
        }
    }
}

#[async_trait]
impl DetectorProvider for ProcessManager {
    async fn detector(&self, name: &str) -> Option<Arc<dyn Detector>> {
        let process = self.process(name).await?;
        Some(Arc::new(ContainerDetector::new(process)))
    }
}

/// Create `input/` and `output/` (owner-only) and write `config.json`
///
/// Returns the `uid:gid` the container must run as to use the directory.
async fn prepare_comm_dir(comm_dir: &Path, config: &Map<String, Value>) -> Result<Option<String>> {
    for sub in [INPUT_DIR, OUTPUT_DIR] {
        tokio::fs::create_dir_all(comm_dir.join(sub)).await?;
    }
    let encoded = serde_json::to_vec_pretty(config)
        .map_err(|e| DetectorError::Internal(format!("cannot encode detector config: {}", e)))?;
    atomic_write(&comm_dir.join("config.json"), &encoded)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        for dir in [comm_dir.to_path_buf(), comm_dir.join(INPUT_DIR), comm_dir.join(OUTPUT_DIR)] {
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }
        let metadata = tokio::fs::metadata(comm_dir).await?;
        Ok(Some(format!("{}:{}", metadata.uid(), metadata.gid())))
    }
    #[cfg(not(unix))]
    {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prepare_comm_dir() {
        let dir = TempDir::new().unwrap();
        let comm = dir.path().join("props-1234");
        let mut config = Map::new();
        config.insert("threshold".to_string(), Value::from(0.5));

        let user = prepare_comm_dir(&comm, &config).await.unwrap();
        assert!(comm.join(INPUT_DIR).is_dir());
        assert!(comm.join(OUTPUT_DIR).is_dir());
        let written: Map<String, Value> =
            serde_json::from_slice(&std::fs::read(comm.join("config.json")).unwrap()).unwrap();
        assert_eq!(written, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&comm).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
            assert!(user.unwrap().contains(':'));
        }
        #[cfg(not(unix))]
        assert!(user.is_none());
    }

    #[test]
    fn test_stopped_status_is_empty() {
        let status = DetectorStatus::stopped("props");
        assert_eq!(status.state, ProcessState::Stopped);
        assert!(status.container_id.is_none());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "stopped");
    }
}
