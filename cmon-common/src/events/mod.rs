//! Event types for the continuity monitor event system
//!
//! Provides shared event definitions and the EventBus used to push detector
//! lifecycle and result notifications to the API layer.

mod detector_types;

pub use detector_types::{InstallStage, ProcessState};

use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Continuity monitor event types
///
/// Events are broadcast via EventBus and can be serialized for the push
/// channel. All producers use this central enum for exhaustive matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CmonEvent {
    /// A detector package passed validation, scanning and build
    DetectorInstalled {
        name: String,
        version: String,
        image_ref: String,
        timestamp: DateTime<Utc>,
    },

    /// A detector was removed; `warnings` lists cascade steps that failed
    DetectorUninstalled {
        name: String,
        warnings: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Install pipeline advanced to a new stage
    InstallProgress {
        /// Detector name (None until the manifest has been read)
        name: Option<String>,
        stage: InstallStage,
        timestamp: DateTime<Utc>,
    },

    /// Detector runtime state transition
    ///
    /// Triggers:
    /// - Push channel: update detector status display
    /// - Recovery supervisor: react to `error`
    DetectorStateChanged {
        name: String,
        old_state: ProcessState,
        new_state: ProcessState,
        /// Human-readable reason for the transition, if any
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A frame pair produced the failure sentinel (confidence -1.0)
    ///
    /// Distinct from a finding: the detector could not analyse the frame.
    DetectorFailure {
        detector_name: String,
        take_id: i64,
        frame_id: i64,
        description: String,
        timestamp: DateTime<Utc>,
    },

    /// A detection result was stored for a take
    ResultRecorded {
        detector_name: String,
        take_id: i64,
        frame_id: i64,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// One or more results were flagged as false positives
    FalsePositiveMarked {
        take_id: i64,
        detector_name: String,
        affected: usize,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The scheduler refused or evicted a frame-pair job
    JobDropped {
        detector_name: String,
        take_id: i64,
        frame_id: i64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Result cache cleared (all detectors when `detector_name` is None)
    CacheCleared {
        detector_name: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl CmonEvent {
    /// Event type name as used in the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            CmonEvent::DetectorInstalled { .. } => "DetectorInstalled",
            CmonEvent::DetectorUninstalled { .. } => "DetectorUninstalled",
            CmonEvent::InstallProgress { .. } => "InstallProgress",
            CmonEvent::DetectorStateChanged { .. } => "DetectorStateChanged",
            CmonEvent::DetectorFailure { .. } => "DetectorFailure",
            CmonEvent::ResultRecorded { .. } => "ResultRecorded",
            CmonEvent::FalsePositiveMarked { .. } => "FalsePositiveMarked",
            CmonEvent::JobDropped { .. } => "JobDropped",
            CmonEvent::CacheCleared { .. } => "CacheCleared",
        }
    }

    /// Wrap the event in a transport envelope for the push channel
    pub fn to_envelope(&self) -> crate::Result<Envelope> {
        Envelope::json(self.event_type(), self)
    }
}

/// Broadcast bus for [`CmonEvent`]s
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CmonEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CmonEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: CmonEvent) -> Result<usize, broadcast::error::SendError<CmonEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CmonEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(CmonEvent::DetectorStateChanged {
            name: "lighting".to_string(),
            old_state: ProcessState::Starting,
            new_state: ProcessState::Running,
            reason: None,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            CmonEvent::DetectorStateChanged { name, new_state, .. } => {
                assert_eq!(name, "lighting");
                assert_eq!(new_state, ProcessState::Running);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        let event = CmonEvent::CacheCleared {
            detector_name: None,
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        // Lossy emit never fails
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);
    }

    #[test]
    fn test_event_envelope_carries_type_tag() {
        let event = CmonEvent::DetectorFailure {
            detector_name: "props".to_string(),
            take_id: 7,
            frame_id: 12,
            description: "Detector timed out".to_string(),
            timestamp: Utc::now(),
        };

        let envelope = event.to_envelope().unwrap();
        assert_eq!(envelope.message_type, "DetectorFailure");

        let decoded: CmonEvent = envelope.decode_json().unwrap();
        assert_eq!(decoded.event_type(), "DetectorFailure");

        let json: serde_json::Value = envelope.decode_json().unwrap();
        assert_eq!(json["type"], "DetectorFailure");
        assert_eq!(json["frame_id"], 12);
    }
}
