//! Detection results

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Confidence sentinel meaning "detector failed", not "no detection"
pub const FAILED_CONFIDENCE: f64 = -1.0;

/// Axis-aligned rectangle in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One detector finding (or failure) for one frame of a take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detector_name: String,
    pub frame_id: i64,
    pub take_id: i64,
    /// 0.0..=1.0, or [`FAILED_CONFIDENCE`]
    pub confidence: f64,
    #[serde(default)]
    pub bounding_boxes: Vec<BoundingBox>,
    pub description: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub is_false_positive: bool,
    #[serde(default)]
    pub false_positive_reason: Option<String>,
    /// Explicit group id supplied by the detector (overrides description grouping)
    #[serde(default)]
    pub error_group_id: Option<String>,
}

impl DetectionResult {
    pub fn new(
        detector_name: impl Into<String>,
        take_id: i64,
        frame_id: i64,
        confidence: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            detector_name: detector_name.into(),
            frame_id,
            take_id,
            confidence,
            bounding_boxes: Vec::new(),
            description: description.into(),
            metadata: Map::new(),
            is_false_positive: false,
            false_positive_reason: None,
            error_group_id: None,
        }
    }

    /// Synthetic failure result (timeout, cancellation, crashed detector)
    ///
    /// `failure_kind` lands in `metadata.failure` so consumers can tell the
    /// causes apart without parsing the description.
    pub fn failure(
        detector_name: impl Into<String>,
        take_id: i64,
        frame_id: i64,
        failure_kind: &str,
        description: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(detector_name, take_id, frame_id, FAILED_CONFIDENCE, description);
        result
            .metadata
            .insert("failure".to_string(), Value::String(failure_kind.to_string()));
        result
    }

    pub fn is_failure(&self) -> bool {
        self.confidence == FAILED_CONFIDENCE
    }

    /// Kind tag of a failure result (`timeout`, `process_error`, ...)
    pub fn failure_kind(&self) -> Option<&str> {
        if !self.is_failure() {
            return None;
        }
        self.metadata.get("failure").and_then(Value::as_str)
    }

    /// Stable hash over the full content, false-positive flag included
    pub fn content_hash(&self) -> String {
        // Map is ordered, so the encoding is deterministic
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&encoded))
    }
}

/// Hash over an ordered set of results
pub fn results_hash(results: &[DetectionResult]) -> String {
    let mut hasher = Sha256::new();
    for result in results {
        hasher.update(result.content_hash().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
