//! In-process container runtime
//!
//! Stands in for the Docker engine. `run` spawns a responder task that plays
//! the detector side of the filesystem channel: it consumes request files
//! from `input/` and writes response files into `output/`.

use async_trait::async_trait;
use cmon_dh::models::{ChannelRequest, ChannelResponse, MessageType, RawFinding};
use cmon_dh::runtime::{
    Availability, BuildOutput, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats,
    RuntimeError,
};
use serde_json::{json, Map};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a fake detector answers frame-pair requests
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Answer with these findings after `delay`
    Respond { findings: Vec<RawFinding>, delay: Duration },
    /// Answer every request with an error document
    Error(String),
    /// Consume requests without answering
    Silent,
    /// Exit (code 137) on the first request
    Crash,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior::Respond {
            findings: vec![finding("Cup moved", 0.8)],
            delay: Duration::from_millis(20),
        }
    }
}

/// One finding as a detector would report it
pub fn finding(description: &str, confidence: f64) -> RawFinding {
    RawFinding {
        error_type: "prop_moved".to_string(),
        confidence,
        location: Some(json!({"x": 10, "y": 10, "width": 20, "height": 20})),
        description: description.to_string(),
        details: Map::new(),
        timestamp: None,
    }
}

#[derive(Debug)]
struct FakeContainer {
    detector: String,
    running: bool,
    exit_code: Option<i64>,
    responder: CancellationToken,
}

#[derive(Debug, Default)]
struct FakeState {
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    behaviors: HashMap<String, Behavior>,
    fail_builds: bool,
    next_id: u64,
}

/// Fake engine shared between the test and the host under test
#[derive(Debug)]
pub struct FakeRuntime {
    available: bool,
    state: Arc<Mutex<FakeState>>,
    round_trips: Arc<AtomicUsize>,
    builds: AtomicUsize,
}

impl FakeRuntime {
    pub fn available() -> Arc<Self> {
        Arc::new(Self {
            available: true,
            state: Arc::new(Mutex::new(FakeState::default())),
            round_trips: Arc::new(AtomicUsize::new(0)),
            builds: AtomicUsize::new(0),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            available: false,
            state: Arc::new(Mutex::new(FakeState::default())),
            round_trips: Arc::new(AtomicUsize::new(0)),
            builds: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, detector: &str, behavior: Behavior) {
        self.state.lock().unwrap().behaviors.insert(detector.to_string(), behavior);
    }

    pub fn fail_builds(&self, fail: bool) {
        self.state.lock().unwrap().fail_builds = fail;
    }

    /// Frame-pair requests answered so far, across all containers
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self.state.lock().unwrap().images.iter().cloned().collect();
        images.sort();
        images
    }

    pub fn running_containers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.running)
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    /// Kill a detector's containers from outside, as the OOM killer would
    pub fn kill(&self, detector: &str) {
        let mut state = self.state.lock().unwrap();
        for container in state.containers.values_mut() {
            if container.detector == detector {
                container.running = false;
                container.exit_code = Some(137);
                container.responder.cancel();
            }
        }
    }

    fn check(&self) -> Result<(), RuntimeError> {
        if self.available {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable("fake engine is down".to_string()))
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn availability(&self) -> Availability {
        if self.available {
            Availability::Available {
                version: "fake-24.0".to_string(),
            }
        } else {
            Availability::Unavailable {
                reason: "fake engine is down".to_string(),
            }
        }
    }

    async fn build_image(&self, context_dir: &Path, image_ref: &str) -> Result<BuildOutput, RuntimeError> {
        self.check()?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.fail_builds {
            return Err(RuntimeError::BuildFailed {
                image: image_ref.to_string(),
                message: "exit status 1".to_string(),
                log: "Step 4/9 : RUN pip install\nERROR: no matching distribution".to_string(),
            });
        }
        assert!(context_dir.join("Dockerfile").is_file(), "build context has no Dockerfile");
        state.images.insert(image_ref.to_string());
        Ok(BuildOutput {
            image_ref: image_ref.to_string(),
            log: "Successfully built".to_string(),
        })
    }

    async fn image_exists(&self, image_ref: &str) -> Result<bool, RuntimeError> {
        self.check()?;
        Ok(self.state.lock().unwrap().images.contains(image_ref))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.check()?;
        let token = CancellationToken::new();
        let handle = {
            let mut state = self.state.lock().unwrap();
            if !state.images.contains(&spec.image_ref) {
                return Err(RuntimeError::NotFound(format!("image {}", spec.image_ref)));
            }
            state.next_id += 1;
            let id = format!("fake{:08}", state.next_id);
            state.containers.insert(
                id.clone(),
                FakeContainer {
                    detector: spec.detector_name.clone(),
                    running: true,
                    exit_code: None,
                    responder: token.clone(),
                },
            );
            ContainerHandle {
                id,
                name: spec.container_name.clone(),
                image_ref: spec.image_ref.clone(),
            }
        };

        tokio::spawn(respond(
            handle.id.clone(),
            spec.detector_name.clone(),
            spec.comm_dir.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.round_trips),
            token,
        ));
        Ok(handle)
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(&handle.id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", handle.id)))?;
        Ok(ContainerState {
            running: container.running,
            exit_code: container.exit_code,
            status: if container.running { "running" } else { "exited" }.to_string(),
        })
    }

    async fn stats(&self, handle: &ContainerHandle) -> Result<ContainerStats, RuntimeError> {
        self.check()?;
        if !self.state.lock().unwrap().containers.contains_key(&handle.id) {
            return Err(RuntimeError::NotFound(format!("container {}", handle.id)));
        }
        Ok(ContainerStats {
            cpu_percent: 12.5,
            memory_bytes: 64 * 1024 * 1024,
            memory_limit_bytes: None,
        })
    }

    async fn stop(&self, handle: &ContainerHandle, _timeout: Duration) -> Result<(), RuntimeError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if let Some(container) = state.containers.get_mut(&handle.id) {
            container.running = false;
            container.exit_code.get_or_insert(0);
            container.responder.cancel();
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.check()?;
        if let Some(container) = self.state.lock().unwrap().containers.remove(&handle.id) {
            container.responder.cancel();
        }
        Ok(())
    }

    async fn remove_detector_containers(&self, detector_name: &str) -> Result<usize, RuntimeError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let ids: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, c)| c.detector == detector_name)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(container) = state.containers.remove(id) {
                container.responder.cancel();
            }
        }
        Ok(ids.len())
    }

    async fn remove_image(&self, image_ref: &str) -> Result<(), RuntimeError> {
        self.check()?;
        self.state.lock().unwrap().images.remove(image_ref);
        Ok(())
    }

    async fn remove_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let prefix = format!("{}:", repository);
        let removed: Vec<String> = state
            .images
            .iter()
            .filter(|image| image.starts_with(&prefix))
            .cloned()
            .collect();
        for image in &removed {
            state.images.remove(image);
        }
        Ok(removed)
    }
}

/// Detector side of the channel for one fake container
async fn respond(
    id: String,
    detector: String,
    comm_dir: PathBuf,
    state: Arc<Mutex<FakeState>>,
    round_trips: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    let input = comm_dir.join("input");
    let output = comm_dir.join("output");
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        let mut names: Vec<String> = match std::fs::read_dir(&input) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| n.ends_with(".json") && !n.starts_with('.'))
                .collect(),
            Err(_) => continue,
        };
        names.sort();

        for name in names {
            let path = input.join(&name);
            let Ok(raw) = std::fs::read(&path) else { continue };
            let _ = std::fs::remove_file(&path);
            let Ok(request) = serde_json::from_slice::<ChannelRequest>(&raw) else { continue };
            if request.kind != MessageType::ProcessFramePair {
                continue;
            }

            let behavior = state
                .lock()
                .unwrap()
                .behaviors
                .get(&detector)
                .cloned()
                .unwrap_or_default();
            let response = match behavior {
                Behavior::Respond { findings, delay } => {
                    tokio::time::sleep(delay).await;
                    ChannelResponse::result(request.id.clone(), findings, delay.as_secs_f64())
                }
                Behavior::Error(message) => ChannelResponse::error(Some(request.id.clone()), message),
                Behavior::Silent => continue,
                Behavior::Crash => {
                    if let Some(container) = state.lock().unwrap().containers.get_mut(&id) {
                        container.running = false;
                        container.exit_code = Some(137);
                    }
                    return;
                }
            };
            if token.is_cancelled() {
                return;
            }
            round_trips.fetch_add(1, Ordering::SeqCst);
            write_response(&output, &request.id, &response);
        }
    }
}

fn write_response(output: &Path, id: &str, response: &ChannelResponse) {
    let body = serde_json::to_vec(response).unwrap();
    let temp = output.join(format!(".{}.tmp", id));
    if std::fs::write(&temp, body).is_ok() {
        let _ = std::fs::rename(&temp, output.join(format!("{}.json", id)));
    }
}
