//! Detector service
//!
//! Composition root of the detector host. Constructs the runtime adapter,
//! installer, process manager, scheduler, result cache and aggregator once,
//! wires them together and owns their lifecycle. The API gateway and the
//! CLI only ever talk to [`DetectorService`].

use crate::aggregation::{ErrorGroup, MatchCriteria, ResultAggregator};
use crate::config::{HostConfig, HostPaths};
use crate::error::{DetectorError, Result};
use crate::frames::{DirectoryFrameSource, FrameSource};
use crate::installer::{DetectorInstaller, DetectorRegistry, InstallOutcome, InstalledDetector, UninstallReport};
use crate::manager::recovery::spawn_recovery;
use crate::manager::{DetectorProvider, DetectorStatus, ProcessManager};
use crate::models::{validate_detector_name, DetectionResult};
use crate::runtime::{Availability, ContainerRuntime, DockerCli};
use crate::scheduler::{CacheStats, FrameScheduler, JobTicket, ResultCache, SchedulerStats, SubmitOutcome};
use chrono::Utc;
use cmon_common::events::{CmonEvent, EventBus};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capacity of the service event bus
const EVENT_BUS_CAPACITY: usize = 1024;

/// One detector's share of a [`DetectorService::process_frame_pair`] call
pub struct FrameSubmission {
    pub detector_name: String,
    pub outcome: SubmitOutcome,
    pub ticket: JobTicket,
}

/// Detector host facade
pub struct DetectorService {
    paths: HostPaths,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventBus,
    installer: Arc<DetectorInstaller>,
    manager: Arc<ProcessManager>,
    scheduler: Arc<FrameScheduler>,
    cache: Arc<ResultCache>,
    aggregator: Arc<ResultAggregator>,
    shutdown: CancellationToken,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl DetectorService {
    /// Production wiring: Docker CLI adapter and on-disk frames
    pub async fn connect(config: HostConfig, paths: HostPaths) -> Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::detect(&config.runtime).await);
        let frames: Arc<dyn FrameSource> = Arc::new(DirectoryFrameSource::new(paths.frames_dir.clone()));
        Self::build(config, paths, runtime, frames).await
    }

    /// Wire every component around the given runtime and frame source
    pub async fn build(
        config: HostConfig,
        paths: HostPaths,
        runtime: Arc<dyn ContainerRuntime>,
        frames: Arc<dyn FrameSource>,
    ) -> Result<Self> {
        paths.ensure_directories()?;
        let events = EventBus::new(EVENT_BUS_CAPACITY);

        let registry = Arc::new(DetectorRegistry::new(paths.registry_path.clone()));
        let installer = Arc::new(DetectorInstaller::new(
            paths.clone(),
            config.installer.clone(),
            config.runtime.clone(),
            Arc::clone(&runtime),
            registry,
            events.clone(),
        ));
        let manager = Arc::new(ProcessManager::new(
            Arc::clone(&runtime),
            Arc::clone(&installer),
            paths.clone(),
            config.runtime.clone(),
            config.channel.clone(),
            config.manager.clone(),
            events.clone(),
        ));

        let cache = Arc::new(ResultCache::new(config.cache.ttl(), config.cache.max_entries_per_take));
        let aggregator = Arc::new(ResultAggregator::new(
            config.aggregation.max_frame_gap,
            Arc::clone(&cache),
            events.clone(),
        ));
        let provider: Arc<dyn DetectorProvider> = Arc::clone(&manager) as Arc<dyn DetectorProvider>;
        let scheduler = Arc::new(FrameScheduler::new(
            config.scheduler.clone(),
            provider,
            frames,
            Arc::clone(&cache),
            Arc::clone(&aggregator),
            events.clone(),
        ));

        let shutdown = CancellationToken::new();
        let recovery = spawn_recovery(
            Arc::clone(&manager),
            config.manager.recovery.clone(),
            shutdown.child_token(),
        );

        match runtime.availability() {
            Availability::Available { version } => {
                info!(root = %paths.root.display(), engine = %version, "Detector service ready")
            }
            Availability::Unavailable { reason } => {
                warn!(root = %paths.root.display(), reason = %reason, "Detector service running without a container engine")
            }
        }

        Ok(Self {
            paths,
            runtime,
            events,
            installer,
            manager,
            scheduler,
            cache,
            aggregator,
            shutdown,
            recovery: Mutex::new(recovery),
        })
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Host events as encoded transport envelopes, for the external push channel
    ///
    /// The forwarder ends when the receiver is dropped or the service shuts
    /// down. A lagging receiver loses events rather than stalling the bus.
    pub fn push_envelopes(&self, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut events = self.events.subscribe();
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Push channel lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let bytes = match event.to_envelope().and_then(|envelope| envelope.encode()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(event = event.event_type(), error = %e, "Event not packed for push");
                        continue;
                    }
                };
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    pub fn availability(&self) -> Availability {
        self.runtime.availability()
    }

    pub fn installer(&self) -> &Arc<DetectorInstaller> {
        &self.installer
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<FrameScheduler> {
        &self.scheduler
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.aggregator
    }

    async fn registered(&self, name: &str) -> Result<InstalledDetector> {
        validate_detector_name(name)?;
        self.installer
            .registry()
            .get(name)
            .await?
            .ok_or_else(|| DetectorError::NotFound(format!("detector '{}' is not installed", name)))
    }

    /// Start a detector with `config` and mark it enabled
    ///
    /// `config` is checked against the manifest schema; defaults fill the
    /// gaps. The detector is only marked enabled once it is running.
    pub async fn enable_detector(&self, name: &str, config: &Map<String, Value>) -> Result<bool> {
        self.runtime.ensure_available()?;
        self.registered(name).await?;
        self.manager.start_detector(name, config).await?;
        self.installer.registry().set_enabled(name, true).await?;
        info!(detector = %name, "Detector enabled");
        Ok(true)
    }

    /// Stop a detector, cancel its queued work and mark it disabled
    ///
    /// Returns whether anything changed.
    pub async fn disable_detector(&self, name: &str) -> Result<bool> {
        let entry = self.registered(name).await?;
        let cancelled = self.scheduler.cancel_detector(name).await;
        let stopped = self.manager.stop_detector(name).await?;
        if entry.enabled {
            self.installer.registry().set_enabled(name, false).await?;
        }
        info!(detector = %name, stopped, cancelled, "Detector disabled");
        Ok(stopped || entry.enabled)
    }

    /// Submit one frame pair to every running, enabled detector
    ///
    /// Returns immediately; each submission carries a ticket for awaiting
    /// its results. Take ids are opaque and not checked here.
    pub async fn process_frame_pair(
        &self,
        reference_take_id: i64,
        current_take_id: i64,
        frame_id: i64,
    ) -> Result<Vec<FrameSubmission>> {
        self.runtime.ensure_available()?;
        let enabled: Vec<String> = self
            .installer
            .registry()
            .list()
            .await?
            .into_iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.name)
            .collect();

        let mut submissions = Vec::new();
        for name in self.manager.running_detectors().await {
            if !enabled.contains(&name) {
                continue;
            }
            let receipt = self
                .scheduler
                .submit(&name, reference_take_id, current_take_id, frame_id)
                .await;
            submissions.push(FrameSubmission {
                detector_name: name,
                outcome: receipt.outcome,
                ticket: receipt.ticket,
            });
        }
        Ok(submissions)
    }

    pub async fn get_detector_status(&self, name: &str) -> Result<DetectorStatus> {
        self.manager.get_status(name).await
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn get_scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats().await
    }

    /// Drop cached results of one detector, or of all; returns entries removed
    pub async fn clear_cache(&self, detector_name: Option<&str>) -> usize {
        let removed = self.cache.clear(detector_name).await;
        info!(detector = ?detector_name, removed, "Result cache cleared");
        self.events.emit_lossy(CmonEvent::CacheCleared {
            detector_name: detector_name.map(str::to_string),
            timestamp: Utc::now(),
        });
        removed
    }

    /// Install (or upgrade) a detector package
    ///
    /// A running detector is restarted on the new version with the
    /// configuration it was running with; its cached results are dropped.
    pub async fn install_detector(&self, archive: &Path, force: bool) -> Result<InstallOutcome> {
        let outcome = self.installer.install(archive, force).await?;
        let name = outcome.detector.name.clone();

        if let Some(process) = self.manager.process(&name).await {
            let config = process.config().clone();
            self.scheduler.cancel_detector(&name).await;
            self.cache.clear(Some(&name)).await;
            self.manager.stop_detector(&name).await?;
            if let Err(e) = self.manager.start_detector(&name, &config).await {
                warn!(detector = %name, error = %e, "Upgraded detector failed to restart");
            }
        }
        Ok(outcome)
    }

    /// Remove a detector completely
    ///
    /// Stop failures become warnings; the registry entry goes regardless.
    pub async fn uninstall_detector(&self, name: &str) -> Result<UninstallReport> {
        validate_detector_name(name)?;
        let mut warnings = Vec::new();

        self.scheduler.cancel_detector(name).await;
        if let Err(e) = self.manager.stop_detector(name).await {
            warnings.push(format!("stopping detector: {}", e));
        }
        self.cache.clear(Some(name)).await;

        let mut report = self.installer.uninstall(name).await?;
        warnings.append(&mut report.warnings);
        report.warnings = warnings;
        Ok(report)
    }

    pub async fn list_detectors(&self) -> Result<Vec<InstalledDetector>> {
        self.installer.registry().list().await
    }

    pub async fn group_results(&self, take_id: i64, include_false_positives: bool) -> Arc<Vec<ErrorGroup>> {
        self.aggregator.group_results(take_id, include_false_positives).await
    }

    pub async fn take_results(&self, take_id: i64, detector_name: Option<&str>) -> Vec<DetectionResult> {
        self.aggregator.results(take_id, detector_name).await
    }

    pub async fn mark_false_positive(
        &self,
        take_id: i64,
        detector_name: &str,
        criteria: &MatchCriteria,
        reason: &str,
    ) -> Result<usize> {
        self.aggregator
            .mark_false_positive(take_id, detector_name, criteria, reason)
            .await
    }

    /// Start every enabled detector with its schema defaults
    ///
    /// Failures are logged and skipped; returns the names started.
    pub async fn start_enabled(&self) -> Result<Vec<String>> {
        self.runtime.ensure_available()?;
        let mut started = Vec::new();
        for entry in self.installer.registry().list().await? {
            if !entry.enabled {
                continue;
            }
            match self.manager.start_detector(&entry.name, &Map::new()).await {
                Ok(_) => started.push(entry.name),
                Err(e) => warn!(detector = %entry.name, error = %e, "Enabled detector failed to start"),
            }
        }
        Ok(started)
    }

    /// Stop everything: recovery, scheduler lanes, then every detector
    pub async fn shutdown(&self) {
        info!("Detector service shutting down");
        self.shutdown.cancel();
        if let Some(handle) = self.recovery.lock().await.take() {
            let _ = handle.await;
        }
        self.scheduler.shutdown().await;
        self.manager.shutdown_all().await;
        info!("Detector service stopped");
    }
}
