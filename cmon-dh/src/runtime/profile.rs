//! Security profile and resource limits for detector containers

use crate::models::DetectorManifest;
use std::path::PathBuf;

/// Label attached to every detector container
pub const DETECTOR_LABEL: &str = "cmon.detector";

/// Mount point of the communication directory inside the container
pub const CONTAINER_COMM_PATH: &str = "/comm";

/// Hardening options applied to every detector container
///
/// Network isolation, the read-only root filesystem and dropping all
/// capabilities are not configurable.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityProfile {
    /// Seccomp allow-list file; `None` leaves the engine default in place
    pub seccomp_profile: Option<PathBuf>,
    /// Capabilities re-added after `--cap-drop ALL`
    pub extra_capabilities: Vec<String>,
    pub gpu_enabled: bool,
    pub tmpfs_tmp_size: String,
    pub tmpfs_shm_size: String,
    /// `uid:gid` the container runs as (owner of the comm directory)
    pub user: Option<String>,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            seccomp_profile: None,
            extra_capabilities: Vec::new(),
            gpu_enabled: false,
            tmpfs_tmp_size: "1g".to_string(),
            tmpfs_shm_size: "2g".to_string(),
            user: None,
        }
    }
}

/// Optional resource ceilings; unset means unlimited
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<f64>,
    pub pids_limit: Option<u32>,
}

impl ResourceLimits {
    pub fn from_manifest(manifest: &DetectorManifest) -> Self {
        Self {
            memory_limit: manifest.docker.memory_limit.clone(),
            cpu_limit: manifest.docker.cpu_limit,
            pids_limit: manifest.docker.pids_limit,
        }
    }
}

/// Everything needed to start one detector container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub detector_name: String,
    pub container_name: String,
    pub image_ref: String,
    /// Host directory bind-mounted at `/comm`; the only host path exposed
    pub comm_dir: PathBuf,
    pub security: SecurityProfile,
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    /// Arguments following `docker run`
    pub fn run_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--detach".into(),
            "--name".into(),
            self.container_name.clone(),
            "--label".into(),
            format!("{}={}", DETECTOR_LABEL, self.detector_name),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--tmpfs".into(),
            format!("/tmp:rw,exec,nosuid,size={}", self.security.tmpfs_tmp_size),
            "--tmpfs".into(),
            format!("/dev/shm:rw,nosuid,size={}", self.security.tmpfs_shm_size),
            "--mount".into(),
            format!(
                "type=bind,source={},target={}",
                self.comm_dir.display(),
                CONTAINER_COMM_PATH
            ),
            "--env".into(),
            format!("CMON_COMM_DIR={}", CONTAINER_COMM_PATH),
        ];

        for capability in &self.security.extra_capabilities {
            args.push("--cap-add".into());
            args.push(capability.to_ascii_uppercase());
        }
        if let Some(profile) = &self.security.seccomp_profile {
            args.push("--security-opt".into());
            args.push(format!("seccomp={}", profile.display()));
        }
        if let Some(user) = &self.security.user {
            args.push("--user".into());
            args.push(user.clone());
        }
        if self.security.gpu_enabled {
            args.push("--gpus".into());
            args.push("all".into());
        }

        if let Some(memory) = &self.limits.memory_limit {
            args.push("--memory".into());
            args.push(memory.clone());
        }
        if let Some(cpus) = self.limits.cpu_limit {
            args.push("--cpus".into());
            args.push(format!("{}", cpus));
        }
        if let Some(pids) = self.limits.pids_limit {
            args.push("--pids-limit".into());
            args.push(pids.to_string());
        }

        args.push(self.image_ref.clone());
        args
    }
}
