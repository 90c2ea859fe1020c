//! Test Helper Utilities
//!
//! Shared utilities for testing cmon-dh

#![allow(dead_code)]

pub mod fake_runtime;
pub mod frames;
pub mod packages;

pub use fake_runtime::{finding, Behavior, FakeRuntime};
pub use frames::{png_header, MemoryFrames};
pub use packages::{clean_package, manifest, package_with_source, write_archive};

use cmon_dh::config::{HostConfig, HostPaths};
use cmon_dh::frames::FrameSource;
use cmon_dh::runtime::ContainerRuntime;
use cmon_dh::DetectorService;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Host configuration with timings short enough for tests
pub fn test_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.channel.poll_interval_ms = 10;
    config.channel.request_timeout_secs = 5;
    config.manager.liveness_interval_secs = 1;
    config.manager.max_liveness_failures = 1;
    config.manager.loop_join_timeout_secs = 2;
    config.manager.shutdown_timeout_secs = 5;
    config.runtime.stop_timeout_secs = 1;
    config.scheduler.initial_timeout_secs = 2;
    config.scheduler.max_timeout_secs = 10;
    config.scheduler.drop_seed = Some(7);
    config
}

/// A detector service rooted in a temporary directory
pub struct TestHost {
    pub dir: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub service: DetectorService,
}

impl TestHost {
    pub async fn new(runtime: Arc<FakeRuntime>) -> Self {
        Self::with_config(runtime, test_config()).await
    }

    pub async fn with_config(runtime: Arc<FakeRuntime>, config: HostConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = HostPaths::new(dir.path().join("root"));
        let frames: Arc<dyn FrameSource> = Arc::new(MemoryFrames::new().with_take(2, 100));
        let engine: Arc<dyn ContainerRuntime> = Arc::clone(&runtime) as Arc<dyn ContainerRuntime>;
        let service = DetectorService::build(config, paths, engine, frames).await.unwrap();
        Self { dir, runtime, service }
    }

    /// Install a clean package
    pub async fn install(&self, name: &str, version: &str) {
        let archive = clean_package(self.dir.path(), name, version);
        self.service.install_detector(&archive, false).await.unwrap();
    }

    pub fn paths(&self) -> &HostPaths {
        self.service.paths()
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
