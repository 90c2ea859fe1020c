//! Container runtime adapter
//!
//! Everything above this module only deals in "build image", "run with
//! profile", "read stats" and "stop". The production backend is
//! [`DockerCli`]; tests substitute their own [`ContainerRuntime`].
//!
//! Engine availability is probed once when the adapter is constructed and
//! cached. Every operation checks the cached flag first and fails fast with
//! [`RuntimeError::Unavailable`] instead of attempting a call per request.

mod docker;
pub mod dockerfile;
mod image;
mod profile;
pub mod seccomp;
pub mod stats;

pub use docker::DockerCli;
pub use image::build_detector_image;
pub use profile::{ContainerSpec, ResourceLimits, SecurityProfile, DETECTOR_LABEL};
pub use stats::ContainerStats;

use crate::error::DetectorError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Container runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Engine daemon not reachable (or never was)
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    /// Image build failed; `log` holds the tail of the build output
    #[error("Image build failed for {image}: {message}")]
    BuildFailed {
        image: String,
        message: String,
        log: String,
    },

    /// Base image or build definition rejected before building
    #[error("Invalid image definition: {0}")]
    InvalidImage(String),

    /// Engine command exited unsuccessfully
    #[error("Engine command failed: {0}")]
    CommandFailed(String),

    /// Engine command exceeded its timeout
    #[error("Engine command '{command}' timed out after {}s", .waited.as_secs())]
    Timeout { command: String, waited: Duration },

    /// Container or image does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Local I/O error (spawning the CLI, reading the socket)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RuntimeError> for DetectorError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(reason) => DetectorError::RuntimeUnavailable(reason),
            RuntimeError::InvalidImage(reason) => DetectorError::Configuration(reason),
            RuntimeError::BuildFailed { image, message, log } => DetectorError::Configuration(
                format!("Image build failed for {}: {}\n{}", image, message, log),
            ),
            RuntimeError::NotFound(what) => DetectorError::NotFound(what),
            other => DetectorError::Internal(other.to_string()),
        }
    }
}

/// Cached engine capability flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available { version: String },
    Unavailable { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available { .. })
    }
}

/// Handle to a started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub image_ref: String,
}

/// Result of an image build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub image_ref: String,
    pub log: String,
}

/// Container state as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Engine status word (`running`, `exited`, `dead`, ...)
    pub status: String,
}

/// Container engine abstraction
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Availability probed at construction time
    fn availability(&self) -> Availability;

    fn ensure_available(&self) -> Result<(), RuntimeError> {
        match self.availability() {
            Availability::Available { .. } => Ok(()),
            Availability::Unavailable { reason } => Err(RuntimeError::Unavailable(reason)),
        }
    }

    /// Build `image_ref` from `context_dir`, always pulling the base image
    async fn build_image(&self, context_dir: &Path, image_ref: &str) -> Result<BuildOutput, RuntimeError>;

    async fn image_exists(&self, image_ref: &str) -> Result<bool, RuntimeError>;

    /// Start a detached container with its [`ContainerSpec`] security profile
    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError>;

    async fn stats(&self, handle: &ContainerHandle) -> Result<ContainerStats, RuntimeError>;

    /// Graceful stop; the engine kills the container after `timeout`
    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError>;

    /// Forced removal; removing a missing container is not an error
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Force-remove every container labelled with `detector_name`
    async fn remove_detector_containers(&self, detector_name: &str) -> Result<usize, RuntimeError>;

    /// Remove one image reference; a missing image is not an error
    async fn remove_image(&self, image_ref: &str) -> Result<(), RuntimeError>;

    /// Remove every tag of `repository`; returns the removed references
    async fn remove_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError>;
}
