//! Detector capability interface
//!
//! The host never loads third-party code. Every detector is reached through
//! [`Detector`], whose only implementation forwards calls across the
//! container boundary via the filesystem channel. The trait is sealed so
//! no in-process implementation can be added from outside this crate.

use super::process::{DetectorProcess, JobOutcome, OutboundJob};
use crate::error::{DetectorError, Result};
use crate::models::{ChannelRequest, FramePayload, RawFinding};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Extra wait past a request's own timeout before the caller gives up on
/// the loop answering
const REPLY_GRACE: Duration = Duration::from_secs(2);

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::ContainerDetector {}
}

/// One unit of detector input
#[derive(Debug, Clone)]
pub struct FramePair {
    pub reference_take_id: i64,
    pub current_take_id: i64,
    pub frame_id: i64,
    pub reference: FramePayload,
    pub current: FramePayload,
}

/// Detector output for one frame pair
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub findings: Vec<RawFinding>,
    /// Time the detector reports it spent, in seconds
    pub processing_time: Option<f64>,
    /// Host-observed round trip
    pub round_trip: Duration,
}

/// Capability interface every detector exposes
#[async_trait]
pub trait Detector: sealed::Sealed + Send + Sync {
    fn name(&self) -> &str;

    /// Ready check; fails unless the detector can take work
    async fn initialize(&self) -> Result<()>;

    /// Analyse one frame pair, waiting at most `timeout` for the answer
    async fn process_frame_pair(&self, pair: FramePair, timeout: Duration) -> Result<FrameAnalysis>;

    /// Ask the detector to shut down cleanly
    async fn cleanup(&self) -> Result<()>;
}

/// Lookup of live detectors by name
#[async_trait]
pub trait DetectorProvider: Send + Sync {
    /// Handle to `name` if it is running
    async fn detector(&self, name: &str) -> Option<Arc<dyn Detector>>;
}

/// [`Detector`] backed by a sandboxed container
#[derive(Debug, Clone)]
pub struct ContainerDetector {
    process: Arc<DetectorProcess>,
}

impl ContainerDetector {
    pub fn new(process: Arc<DetectorProcess>) -> Self {
        Self { process }
    }

    pub fn process(&self) -> &Arc<DetectorProcess> {
        &self.process
    }

    async fn submit(&self, request: ChannelRequest, timeout: Option<Duration>) -> Result<oneshot::Receiver<JobOutcome>> {
        let (reply, receiver) = oneshot::channel();
        self.process
            .outbound()
            .send(OutboundJob { request, timeout, reply })
            .await
            .map_err(|_| DetectorError::process(self.name(), "communication loop is not running"))?;
        Ok(receiver)
    }
}

#[async_trait]
impl Detector for ContainerDetector {
    fn name(&self) -> &str {
        self.process.name()
    }

    async fn initialize(&self) -> Result<()> {
        let state = self.process.state();
        if state.accepts_work() {
            Ok(())
        } else {
            Err(DetectorError::process(self.name(), format!("detector is {}", state)))
        }
    }

    async fn process_frame_pair(&self, pair: FramePair, timeout: Duration) -> Result<FrameAnalysis> {
        self.initialize().await?;

        let mut metadata = Map::new();
        metadata.insert("reference_take_id".to_string(), Value::from(pair.reference_take_id));
        metadata.insert("current_take_id".to_string(), Value::from(pair.current_take_id));
        metadata.insert("frame_id".to_string(), Value::from(pair.frame_id));
        let request = ChannelRequest::frame_pair(
            Uuid::new_v4().to_string(),
            pair.current,
            pair.reference,
            metadata,
        );

        let started = Instant::now();
        let receiver = self.submit(request, Some(timeout)).await?;
        let timed_out = || DetectorError::Timeout {
            detector: self.name().to_string(),
            waited: timeout,
        };

        match tokio::time::timeout(timeout + REPLY_GRACE, receiver).await {
            Ok(Ok(JobOutcome::Completed(response))) => {
                if let Some(message) = response.failure_message() {
                    return Err(DetectorError::process(self.name(), message));
                }
                Ok(FrameAnalysis {
                    findings: response.results,
                    processing_time: response.processing_time,
                    round_trip: started.elapsed(),
                })
            }
            Ok(Ok(JobOutcome::TimedOut)) | Err(_) => Err(timed_out()),
            Ok(Ok(JobOutcome::Cancelled)) | Ok(Err(_)) => Err(DetectorError::Cancelled(self.name().to_string())),
            Ok(Ok(JobOutcome::Failed(reason))) => Err(DetectorError::process(self.name(), reason)),
            Ok(Ok(JobOutcome::Delivered)) => Err(DetectorError::Internal(
                "frame-pair request acknowledged without a response".to_string(),
            )),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        let request = ChannelRequest::shutdown(Uuid::new_v4().to_string());
        let receiver = self.submit(request, None).await?;
        match receiver.await {
            Ok(JobOutcome::Delivered) => Ok(()),
            Ok(JobOutcome::Failed(reason)) => Err(DetectorError::process(self.name(), reason)),
            Ok(_) | Err(_) => Err(DetectorError::Cancelled(self.name().to_string())),
        }
    }
}
