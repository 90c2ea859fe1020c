//! Live detector process and its communication loop
//!
//! One [`DetectorProcess`] per running detector. Its loop task is the sole
//! owner of the detector's [`SecureChannel`]; everything else talks to the
//! loop through the outbound job queue.

use crate::channel::SecureChannel;
use crate::models::{ChannelRequest, ChannelResponse, MessageType};
use crate::runtime::{ContainerHandle, ContainerRuntime};
use chrono::{DateTime, TimeZone, Utc};
use cmon_common::events::{CmonEvent, EventBus, ProcessState};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How an outbound request ended
#[derive(Debug)]
pub(crate) enum JobOutcome {
    /// The detector answered (possibly with an error body)
    Completed(ChannelResponse),
    /// Written to `input/`; used for messages that expect no answer
    Delivered,
    /// No answer within the request's timeout
    TimedOut,
    /// Detector was stopped while the request was outstanding
    Cancelled,
    /// Request could not be delivered or the detector failed
    Failed(String),
}

/// Request handed to the communication loop
#[derive(Debug)]
pub(crate) struct OutboundJob {
    pub request: ChannelRequest,
    pub timeout: Option<Duration>,
    pub reply: oneshot::Sender<JobOutcome>,
}

/// Runtime handle for one running detector
#[derive(Debug)]
pub struct DetectorProcess {
    name: String,
    container: ContainerHandle,
    comm_dir: PathBuf,
    config: Map<String, Value>,
    started_at: DateTime<Utc>,
    state: watch::Sender<ProcessState>,
    frame_count: AtomicU64,
    error_count: AtomicU64,
    pending: AtomicUsize,
    /// Unix millis of the last sign of life; 0 when none yet
    last_heartbeat_ms: AtomicI64,
    outbound: mpsc::Sender<OutboundJob>,
    cancel: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
}

impl DetectorProcess {
    pub(crate) fn new(
        name: String,
        container: ContainerHandle,
        comm_dir: PathBuf,
        config: Map<String, Value>,
        outbound: mpsc::Sender<OutboundJob>,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            name,
            container,
            comm_dir,
            config,
            started_at: Utc::now(),
            state,
            frame_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            last_heartbeat_ms: AtomicI64::new(0),
            outbound,
            cancel: CancellationToken::new(),
            loop_task: Mutex::new(None),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    pub fn comm_dir(&self) -> &Path {
        &self.comm_dir
    }

    /// Resolved configuration the detector was started with
    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Requests written but not yet answered
    pub fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        match self.last_heartbeat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    fn heartbeat(&self) {
        self.last_heartbeat_ms
            .store(cmon_common::time::unix_millis(), Ordering::Relaxed);
    }

    pub(crate) fn outbound(&self) -> &mpsc::Sender<OutboundJob> {
        &self.outbound
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Transition to `new_state`, emitting an event when it changes
    pub(crate) fn set_state(&self, new_state: ProcessState, reason: Option<String>) {
        let old_state = self.state.send_replace(new_state);
        if old_state == new_state {
            return;
        }
        info!(
            detector = %self.name,
            from = %old_state,
            to = %new_state,
            reason = reason.as_deref().unwrap_or(""),
            "Detector state changed"
        );
        self.events.emit_lossy(CmonEvent::DetectorStateChanged {
            name: self.name.clone(),
            old_state,
            new_state,
            reason,
            timestamp: Utc::now(),
        });
    }

    pub(crate) async fn attach_loop(&self, task: JoinHandle<()>) {
        *self.loop_task.lock().await = Some(task);
    }

    /// Cancel the loop and wait up to `timeout` for it; aborts on expiry
    ///
    /// Returns false when the loop had to be aborted.
    pub(crate) async fn join_loop(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let Some(mut task) = self.loop_task.lock().await.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(detector = %self.name, error = %e, "Communication loop ended abnormally");
                true
            }
            Err(_) => {
                task.abort();
                warn!(detector = %self.name, "Communication loop did not stop in time; aborted");
                false
            }
        }
    }
}

/// Settings the loop needs
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopSettings {
    pub poll_interval: Duration,
    pub liveness_interval: Duration,
    pub max_liveness_failures: u32,
}

struct Waiter {
    reply: oneshot::Sender<JobOutcome>,
}

/// Why the loop stopped
enum Exit {
    Cancelled,
    Fault(String),
}

/// Communication loop for one detector
///
/// **Algorithm:**
/// - outbound job: write it with `send()`; frame-pair requests wait for a
///   correlated response
/// - poll tick: consume `output/`, answer waiters by message id, expire
///   requests past their deadline as timeouts, forget requests whose
///   caller went away
/// - liveness tick: inspect the container; a stopped container or a
///   missing channel directory is fatal, engine errors degrade the
///   detector until `max_liveness_failures` consecutive failures
///
/// On exit every outstanding waiter is answered: `Cancelled` when the loop
/// was cancelled, `Failed` after a fault.
pub(crate) async fn run_comm_loop(
    process: Arc<DetectorProcess>,
    mut channel: SecureChannel,
    runtime: Arc<dyn ContainerRuntime>,
    mut jobs: mpsc::Receiver<OutboundJob>,
    settings: LoopSettings,
) {
    let name = process.name().to_string();
    let mut waiters: HashMap<String, Waiter> = HashMap::new();
    let mut poll = interval(settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut liveness = interval_at(
        Instant::now() + settings.liveness_interval,
        settings.liveness_interval,
    );
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut liveness_failures: u32 = 0;
    let cancel = process.cancel_token().clone();

    debug!(detector = %name, "Communication loop started");

    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break Exit::Cancelled,

            job = jobs.recv() => {
                let Some(job) = job else { break Exit::Cancelled };
                dispatch(&process, &mut channel, &mut waiters, job).await;
            }

            _ = poll.tick() => {
                if let Err(reason) = poll_once(&process, &mut channel, &mut waiters).await {
                    break Exit::Fault(reason);
                }
            }

            _ = liveness.tick() => {
                if !channel.directories_present() {
                    break Exit::Fault("communication directory lost".to_string());
                }
                match runtime.inspect(process.container()).await {
                    Ok(state) if state.running => {
                        liveness_failures = 0;
                        process.heartbeat();
                        if process.state() == ProcessState::Degraded {
                            process.set_state(ProcessState::Running, Some("liveness restored".to_string()));
                        }
                    }
                    Ok(state) => {
                        break Exit::Fault(format!(
                            "container {} unexpectedly (exit code {})",
                            state.status,
                            state.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
                        ));
                    }
                    Err(e) => {
                        liveness_failures += 1;
                        warn!(
                            detector = %name,
                            failures = liveness_failures,
                            error = %e,
                            "Liveness check failed"
                        );
                        if liveness_failures >= settings.max_liveness_failures {
                            break Exit::Fault(format!(
                                "{} consecutive liveness failures: {}",
                                liveness_failures, e
                            ));
                        }
                        process.set_state(ProcessState::Degraded, Some(e.to_string()));
                    }
                }
            }
        }
    };

    jobs.close();
    let reason = match &exit {
        Exit::Cancelled => None,
        Exit::Fault(reason) => {
            error!(detector = %name, reason = %reason, "Detector failed");
            process.set_state(ProcessState::Error, Some(reason.clone()));
            Some(reason.clone())
        }
    };
    let outcome = || match &reason {
        None => JobOutcome::Cancelled,
        Some(reason) => JobOutcome::Failed(reason.clone()),
    };

    channel.cancel_all().await;
    for (_, waiter) in waiters.drain() {
        let _ = waiter.reply.send(outcome());
    }
    while let Ok(job) = jobs.try_recv() {
        let _ = job.reply.send(outcome());
    }
    process.pending.store(0, Ordering::Relaxed);
    debug!(detector = %name, "Communication loop stopped");
}

async fn dispatch(
    process: &DetectorProcess,
    channel: &mut SecureChannel,
    waiters: &mut HashMap<String, Waiter>,
    job: OutboundJob,
) {
    match channel.send(&job.request, job.timeout).await {
        Ok(id) if job.request.kind == MessageType::ProcessFramePair => {
            waiters.insert(id, Waiter { reply: job.reply });
            process.pending.store(channel.pending_count(), Ordering::Relaxed);
        }
        Ok(_) => {
            let _ = job.reply.send(JobOutcome::Delivered);
        }
        Err(e) => {
            process.error_count.fetch_add(1, Ordering::Relaxed);
            warn!(detector = %process.name(), request_id = %job.request.id, error = %e, "Failed to write request");
            let _ = job.reply.send(JobOutcome::Failed(e.to_string()));
        }
    }
}

async fn poll_once(
    process: &DetectorProcess,
    channel: &mut SecureChannel,
    waiters: &mut HashMap<String, Waiter>,
) -> Result<(), String> {
    let responses = channel
        .poll_results()
        .await
        .map_err(|e| format!("cannot read responses: {}", e))?;

    for response in responses {
        process.heartbeat();
        let failed = response.failure_message().is_some();
        if failed {
            process.error_count.fetch_add(1, Ordering::Relaxed);
        }
        match response.id.clone() {
            Some(id) => match waiters.remove(&id) {
                Some(waiter) => {
                    process.frame_count.fetch_add(1, Ordering::Relaxed);
                    let _ = waiter.reply.send(JobOutcome::Completed(response));
                }
                None => debug!(detector = %process.name(), request_id = %id, "Response for unknown request dropped"),
            },
            None => warn!(
                detector = %process.name(),
                error = response.failure_message().unwrap_or_default(),
                "Detector reported an uncorrelated error"
            ),
        }
    }

    for id in channel.expire_stale().await {
        process.error_count.fetch_add(1, Ordering::Relaxed);
        if let Some(waiter) = waiters.remove(&id) {
            let _ = waiter.reply.send(JobOutcome::TimedOut);
        }
    }

    // Callers that gave up no longer need their request processed
    let abandoned: Vec<String> = waiters
        .iter()
        .filter(|(_, waiter)| waiter.reply.is_closed())
        .map(|(id, _)| id.clone())
        .collect();
    for id in abandoned {
        waiters.remove(&id);
        channel.forget(&id).await;
    }

    process.pending.store(channel.pending_count(), Ordering::Relaxed);
    Ok(())
}
