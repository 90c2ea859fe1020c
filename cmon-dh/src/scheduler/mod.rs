//! Frame-pair scheduler
//!
//! Turns captured frame ids into bounded, prioritised, deduplicated detector
//! work. Each detector has its own lane:
//!
//! - a [`BoundedJobQueue`] ordered by frame position priority
//! - a pending map keyed by [`JobFingerprint`]; a fingerprint stays in it
//!   from admission until its result is published, so identical
//!   submissions coalesce onto one container round trip
//! - a dispatcher task that runs at most `max_in_flight_per_detector` jobs
//!   at once, cancelled through the lane's token
//! - an [`AdaptiveTimeout`] fed by observed round trips
//!
//! Every job ends with results. Timeouts, cancellations and detector
//! faults produce a synthetic result with confidence -1.0 whose
//! `metadata.failure` names the cause. Failures are recorded but never
//! cached, so a later submission retries.

mod cache;
mod priority;
mod queue;
mod timeout;

pub use cache::{CacheStats, ResultCache};
pub use priority::{frame_priority, FramePriority, BOUNDARY_BAND};
pub use queue::{Admission, BoundedJobQueue, DropReason, QueueCounters};
pub use timeout::AdaptiveTimeout;

use crate::aggregation::ResultAggregator;
use crate::config::SchedulerConfig;
use crate::error::DetectorError;
use crate::frames::{encode_payload, FrameSource};
use crate::manager::{DetectorProvider, FramePair};
use crate::models::{BoundingBox, DetectionResult, FramePairJob, JobFingerprint, RawFinding, FAILED_CONFIDENCE};
use chrono::Utc;
use cmon_common::events::{CmonEvent, EventBus};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a job ended
#[derive(Debug, Clone)]
pub enum JobCompletion {
    /// Results of the round trip (possibly a single failure result)
    Finished(Arc<Vec<DetectionResult>>),
    /// Never ran
    Dropped(DropReason),
}

impl JobCompletion {
    pub fn results(&self) -> Option<&Arc<Vec<DetectionResult>>> {
        match self {
            JobCompletion::Finished(results) => Some(results),
            JobCompletion::Dropped(_) => None,
        }
    }
}

/// Immediate answer to [`FrameScheduler::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Coalesced onto a pending job or served from the cache
    Deduped,
    Dropped(DropReason),
}

enum TicketState {
    Ready(JobCompletion),
    Pending(watch::Receiver<Option<JobCompletion>>),
}

/// Handle for awaiting one submission's completion
pub struct JobTicket {
    fingerprint: JobFingerprint,
    state: TicketState,
}

impl JobTicket {
    fn ready(fingerprint: JobFingerprint, completion: JobCompletion) -> Self {
        Self {
            fingerprint,
            state: TicketState::Ready(completion),
        }
    }

    pub fn fingerprint(&self) -> &JobFingerprint {
        &self.fingerprint
    }

    /// Wait for the job to finish or be dropped
    ///
    /// Bounded by the job's own timeout: the dispatcher always publishes a
    /// completion, and a lane torn down underneath the ticket reads as
    /// cancelled.
    pub async fn wait(self) -> JobCompletion {
        match self.state {
            TicketState::Ready(completion) => completion,
            TicketState::Pending(mut receiver) => match receiver.wait_for(|value| value.is_some()).await {
                Ok(value) => value.clone().unwrap_or(JobCompletion::Dropped(DropReason::Cancelled)),
                Err(_) => JobCompletion::Dropped(DropReason::Cancelled),
            },
        }
    }
}

/// What [`FrameScheduler::submit`] hands back
pub struct SubmitReceipt {
    pub outcome: SubmitOutcome,
    pub ticket: JobTicket,
}

/// Per-detector scheduler counters
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub queue_depth: usize,
    /// Jobs currently in a container round trip
    pub running: usize,
    pub submitted: u64,
    pub accepted: u64,
    pub deduped: u64,
    pub shed: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub current_timeout_secs: f64,
}

/// Scheduler counters for every detector with a lane
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub detectors: BTreeMap<String, LaneStats>,
}

type Completion = watch::Sender<Option<JobCompletion>>;

struct DetectorLane {
    name: String,
    queue: Mutex<BoundedJobQueue>,
    pending: Mutex<HashMap<JobFingerprint, Completion>>,
    timeout: Mutex<AdaptiveTimeout>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    notify: Notify,
    cancel: CancellationToken,
    deduped: AtomicU64,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DetectorLane {
    fn new(name: &str, config: &SchedulerConfig) -> Self {
        let max_in_flight = config.max_in_flight_per_detector.max(1);
        Self {
            name: name.to_string(),
            queue: Mutex::new(BoundedJobQueue::new(
                config.queue_capacity,
                config.high_water_mark,
                config.max_drop_ratio,
                config.drop_seed,
            )),
            pending: Mutex::new(HashMap::new()),
            timeout: Mutex::new(AdaptiveTimeout::new(
                config.initial_timeout(),
                config.max_timeout(),
                config.latency_window,
                config.latency_min_samples,
                config.timeout_multiplier,
            )),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            deduped: AtomicU64::new(0),
            dispatcher: std::sync::Mutex::new(None),
        }
    }

    fn take_dispatcher(&self) -> Option<JoinHandle<()>> {
        match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    async fn stats(&self) -> LaneStats {
        let (queue_depth, counters) = {
            let queue = self.queue.lock().await;
            (queue.len(), queue.counters())
        };
        LaneStats {
            queue_depth,
            running: self.max_in_flight - self.permits.available_permits().min(self.max_in_flight),
            submitted: counters.submitted,
            accepted: counters.accepted,
            deduped: self.deduped.load(Ordering::Relaxed),
            shed: counters.shed,
            rejected: counters.rejected,
            evicted: counters.evicted,
            current_timeout_secs: self.timeout.lock().await.current().as_secs_f64(),
        }
    }
}

/// Everything a running job needs, shared with the dispatcher tasks
struct JobContext {
    provider: Arc<dyn DetectorProvider>,
    frames: Arc<dyn FrameSource>,
    cache: Arc<ResultCache>,
    aggregator: Arc<ResultAggregator>,
    events: EventBus,
}

/// Frame-pair scheduler
pub struct FrameScheduler {
    config: SchedulerConfig,
    context: Arc<JobContext>,
    lanes: RwLock<HashMap<String, Arc<DetectorLane>>>,
}

impl FrameScheduler {
    pub fn new(
        config: SchedulerConfig,
        provider: Arc<dyn DetectorProvider>,
        frames: Arc<dyn FrameSource>,
        cache: Arc<ResultCache>,
        aggregator: Arc<ResultAggregator>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            context: Arc::new(JobContext {
                provider,
                frames,
                cache,
                aggregator,
                events,
            }),
            lanes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.context.cache
    }

    async fn lane(&self, detector: &str) -> Arc<DetectorLane> {
        if let Some(lane) = self.lanes.read().await.get(detector) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write().await;
        if let Some(lane) = lanes.get(detector) {
            return Arc::clone(lane);
        }

        let lane = Arc::new(DetectorLane::new(detector, &self.config));
        let handle = tokio::spawn(dispatch(Arc::clone(&lane), Arc::clone(&self.context)));
        if let Ok(mut slot) = lane.dispatcher.lock() {
            *slot = Some(handle);
        }
        debug!(detector = %detector, "Scheduler lane created");
        lanes.insert(detector.to_string(), Arc::clone(&lane));
        lane
    }

    /// Submit one frame pair for one detector
    ///
    /// Never blocks on detector work. A fingerprint that is already pending
    /// or has cached results is coalesced (`Deduped`) and the ticket
    /// resolves to the same results the original submission gets.
    ///
    /// **Algorithm:**
    /// 1. Under the lane's pending lock: coalesce onto a pending job, or
    ///    serve from the cache
    /// 2. Score the frame by its position in the take (estimated when the
    ///    take's length is unknown)
    /// 3. Offer the job to the queue; an evicted resident is completed as
    ///    dropped
    pub async fn submit(
        &self,
        detector_name: &str,
        reference_take_id: i64,
        current_take_id: i64,
        frame_id: i64,
    ) -> SubmitReceipt {
        let lane = self.lane(detector_name).await;
        let fingerprint = JobFingerprint::new(detector_name, current_take_id, frame_id);

        let mut pending = lane.pending.lock().await;
        if let Some(sender) = pending.get(&fingerprint) {
            lane.deduped.fetch_add(1, Ordering::Relaxed);
            debug!(job = %fingerprint, "Coalesced onto pending job");
            return SubmitReceipt {
                outcome: SubmitOutcome::Deduped,
                ticket: JobTicket {
                    fingerprint,
                    state: TicketState::Pending(sender.subscribe()),
                },
            };
        }
        if let Some(results) = self.context.cache.get(&fingerprint).await {
            lane.deduped.fetch_add(1, Ordering::Relaxed);
            debug!(job = %fingerprint, "Served from result cache");
            return SubmitReceipt {
                outcome: SubmitOutcome::Deduped,
                ticket: JobTicket::ready(fingerprint, JobCompletion::Finished(results)),
            };
        }

        let (index, total) = match self.context.frames.position(current_take_id, frame_id).await {
            Some(position) => (position.index, position.total),
            None => (
                frame_id,
                self.config.estimated_frames_per_take.max(frame_id.saturating_add(1)),
            ),
        };
        let priority = frame_priority(index, total, self.config.boundary_window);
        let job = FramePairJob {
            detector_name: detector_name.to_string(),
            reference_take_id,
            current_take_id,
            frame_id,
            enqueued_at: Utc::now(),
            priority: priority.score,
            boundary: priority.boundary,
        };

        let admission = lane.queue.lock().await.push(job.clone());
        let outcome = match admission {
            Admission::Accepted => SubmitOutcome::Accepted,
            Admission::AcceptedWithEviction { evicted } => {
                let evicted_fingerprint = evicted.fingerprint();
                if let Some(sender) = pending.remove(&evicted_fingerprint) {
                    sender.send_replace(Some(JobCompletion::Dropped(DropReason::Evicted)));
                }
                self.announce_drop(&evicted, DropReason::Evicted);
                SubmitOutcome::Accepted
            }
            Admission::Dropped(reason) => {
                self.announce_drop(&job, reason);
                return SubmitReceipt {
                    outcome: SubmitOutcome::Dropped(reason),
                    ticket: JobTicket::ready(fingerprint, JobCompletion::Dropped(reason)),
                };
            }
        };

        let (sender, receiver) = watch::channel(None);
        pending.insert(fingerprint.clone(), sender);
        drop(pending);
        lane.notify.notify_one();

        SubmitReceipt {
            outcome,
            ticket: JobTicket {
                fingerprint,
                state: TicketState::Pending(receiver),
            },
        }
    }

    fn announce_drop(&self, job: &FramePairJob, reason: DropReason) {
        debug!(
            detector = %job.detector_name,
            take_id = job.current_take_id,
            frame_id = job.frame_id,
            reason = reason.as_str(),
            "Frame-pair job dropped"
        );
        self.context.events.emit_lossy(CmonEvent::JobDropped {
            detector_name: job.detector_name.clone(),
            take_id: job.current_take_id,
            frame_id: job.frame_id,
            reason: reason.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Tear down a detector's lane
    ///
    /// Queued jobs complete as cancelled. Jobs already in a round trip
    /// finish through their detector (which is being stopped, so they end
    /// as cancellation failures). Returns the number of queued jobs
    /// cancelled.
    pub async fn cancel_detector(&self, detector_name: &str) -> usize {
        let Some(lane) = self.lanes.write().await.remove(detector_name) else {
            return 0;
        };
        lane.cancel.cancel();

        let drained = lane.queue.lock().await.drain();
        {
            let mut pending = lane.pending.lock().await;
            for job in &drained {
                if let Some(sender) = pending.remove(&job.fingerprint()) {
                    sender.send_replace(Some(JobCompletion::Dropped(DropReason::Cancelled)));
                }
            }
        }
        for job in &drained {
            self.announce_drop(job, DropReason::Cancelled);
        }
        if !drained.is_empty() {
            info!(detector = %detector_name, cancelled = drained.len(), "Cancelled queued frame-pair jobs");
        }
        drained.len()
    }

    /// Cancel every lane and wait for the dispatchers to exit
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.lanes.read().await.keys().cloned().collect();
        let mut handles = Vec::new();
        for name in names {
            let lane = self.lanes.read().await.get(&name).cloned();
            self.cancel_detector(&name).await;
            if let Some(handle) = lane.and_then(|lane| lane.take_dispatcher()) {
                handles.push(handle);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Current queue snapshot of one detector, most urgent first
    pub async fn queue_snapshot(&self, detector_name: &str) -> Vec<FramePairJob> {
        let lane = self.lanes.read().await.get(detector_name).cloned();
        match lane {
            Some(lane) => lane.queue.lock().await.snapshot(),
            None => Vec::new(),
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let lanes: Vec<Arc<DetectorLane>> = self.lanes.read().await.values().cloned().collect();
        let mut stats = SchedulerStats::default();
        for lane in lanes {
            stats.detectors.insert(lane.name.clone(), lane.stats().await);
        }
        stats
    }
}

/// Lane dispatcher: one permit per running job
async fn dispatch(lane: Arc<DetectorLane>, context: Arc<JobContext>) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = lane.cancel.cancelled() => break,
            permit = Arc::clone(&lane.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = loop {
            if let Some(job) = lane.queue.lock().await.pop() {
                break Some(job);
            }
            tokio::select! {
                biased;
                _ = lane.cancel.cancelled() => break None,
                _ = lane.notify.notified() => {}
            }
        };
        let Some(job) = job else { break };

        let lane = Arc::clone(&lane);
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            run_job(&context, &lane, job).await;
            drop(permit);
        });
    }
    debug!(detector = %lane.name, "Scheduler dispatcher stopped");
}

/// Run one job to completion and publish its results
async fn run_job(context: &JobContext, lane: &DetectorLane, job: FramePairJob) {
    let fingerprint = job.fingerprint();
    let timeout = lane.timeout.lock().await.current();

    let results = match execute(context, &job, timeout).await {
        Ok((results, round_trip)) => {
            lane.timeout.lock().await.observe(round_trip);
            results
        }
        Err(failure) => {
            if failure.failure_kind() == Some("timeout") {
                lane.timeout.lock().await.observe_timeout(timeout);
            }
            warn!(
                detector = %job.detector_name,
                take_id = job.current_take_id,
                frame_id = job.frame_id,
                failure = %failure.description,
                "Frame-pair job failed"
            );
            vec![failure]
        }
    };

    let stored = context.aggregator.record_frame_results(&fingerprint, results).await;
    if !stored.iter().any(DetectionResult::is_failure) {
        context.cache.put(fingerprint.clone(), stored.clone()).await;
    }

    let completion = JobCompletion::Finished(Arc::new(stored));
    if let Some(sender) = lane.pending.lock().await.remove(&fingerprint) {
        sender.send_replace(Some(completion));
    }
}

/// One container round trip; failures come back as a synthetic result
async fn execute(
    context: &JobContext,
    job: &FramePairJob,
    timeout: Duration,
) -> std::result::Result<(Vec<DetectionResult>, Duration), DetectionResult> {
    let fail = |kind: &str, description: String| {
        DetectionResult::failure(&job.detector_name, job.current_take_id, job.frame_id, kind, description)
    };

    let Some(detector) = context.provider.detector(&job.detector_name).await else {
        return Err(fail("not_running", format!("Detector '{}' is not running", job.detector_name)));
    };

    let (reference, current) = match load_pair(context, job).await {
        Ok(pair) => pair,
        Err(e) => return Err(fail("frame_unavailable", format!("Frame unavailable: {}", e))),
    };
    let pair = FramePair {
        reference_take_id: job.reference_take_id,
        current_take_id: job.current_take_id,
        frame_id: job.frame_id,
        reference,
        current,
    };

    match detector.process_frame_pair(pair, timeout).await {
        Ok(analysis) => {
            let results = analysis
                .findings
                .iter()
                .map(|finding| result_from_finding(job, finding, analysis.processing_time))
                .collect();
            Ok((results, analysis.round_trip))
        }
        Err(e) => {
            let kind = match &e {
                DetectorError::Timeout { .. } => "timeout",
                DetectorError::Cancelled(_) => "cancelled",
                DetectorError::RuntimeUnavailable(_) => "unavailable",
                _ => "process_error",
            };
            Err(fail(kind, format!("Detector failure: {}", e)))
        }
    }
}

async fn load_pair(
    context: &JobContext,
    job: &FramePairJob,
) -> crate::error::Result<(crate::models::FramePayload, crate::models::FramePayload)> {
    let reference = context.frames.load_png(job.reference_take_id, job.frame_id).await?;
    let current = context.frames.load_png(job.current_take_id, job.frame_id).await?;
    Ok((encode_payload(&reference)?, encode_payload(&current)?))
}

/// Map a detector's raw finding onto a [`DetectionResult`]
fn result_from_finding(job: &FramePairJob, finding: &RawFinding, processing_time: Option<f64>) -> DetectionResult {
    let confidence = if finding.confidence == FAILED_CONFIDENCE {
        FAILED_CONFIDENCE
    } else if finding.confidence.is_finite() {
        finding.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let description = if finding.description.is_empty() {
        finding.error_type.clone()
    } else {
        finding.description.clone()
    };

    let mut result = DetectionResult::new(
        &job.detector_name,
        job.current_take_id,
        job.frame_id,
        confidence,
        description,
    );
    if let Some(location) = &finding.location {
        if let Ok(bbox) = serde_json::from_value::<BoundingBox>(location.clone()) {
            result.bounding_boxes.push(bbox);
        }
    }
    result.error_group_id = finding
        .details
        .get("group_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    result.metadata.insert("error_type".to_string(), Value::from(finding.error_type.clone()));
    result.metadata.insert("reference_take_id".to_string(), Value::from(job.reference_take_id));
    if !finding.details.is_empty() {
        result.metadata.insert("details".to_string(), Value::Object(finding.details.clone()));
    }
    if let Some(seconds) = processing_time {
        result.metadata.insert("processing_time".to_string(), Value::from(seconds));
    }
    result
}
