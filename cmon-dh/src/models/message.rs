//! Detector wire format
//!
//! JSON documents exchanged through the filesystem channel. One file per
//! message; requests go to `input/`, responses come back in `output/`.
//!
//! ```text
//! Request:  { "id", "type": "process_frame_pair", "current_frame", "reference_frame", "metadata", "timestamp" }
//! Response: { "id", "type": "result"|"error", "timestamp", "processing_time", "results": [...] } | { "error" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message `type` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ProcessFramePair,
    Result,
    Error,
    Shutdown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ProcessFramePair => "process_frame_pair",
            MessageType::Result => "result",
            MessageType::Error => "error",
            MessageType::Shutdown => "shutdown",
        }
    }
}

/// Encoded frame: `[height, width, channels]`, dtype and base64 PNG bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    pub shape: Vec<u32>,
    pub dtype: String,
    pub data: String,
}

/// Request written to the detector's `input/` directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_frame: Option<FramePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_frame: Option<FramePayload>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl ChannelRequest {
    pub fn frame_pair(
        id: impl Into<String>,
        current_frame: FramePayload,
        reference_frame: FramePayload,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: MessageType::ProcessFramePair,
            current_frame: Some(current_frame),
            reference_frame: Some(reference_frame),
            metadata,
            timestamp: cmon_common::time::unix_seconds(),
        }
    }

    pub fn shutdown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MessageType::Shutdown,
            current_frame: None,
            reference_frame: None,
            metadata: Map::new(),
            timestamp: cmon_common::time::unix_seconds(),
        }
    }
}

/// One raw finding inside a detector response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    #[serde(default)]
    pub error_type: String,
    pub confidence: f64,
    /// `{x, y, width, height}` when the finding is localised
    #[serde(default)]
    pub location: Option<Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// Response read from the detector's `output/` directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<MessageType>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    /// Seconds spent inside the detector
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub results: Vec<RawFinding>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ChannelResponse {
    pub fn result(id: impl Into<String>, results: Vec<RawFinding>, processing_time: f64) -> Self {
        Self {
            id: Some(id.into()),
            kind: Some(MessageType::Result),
            timestamp: Some(cmon_common::time::unix_seconds()),
            processing_time: Some(processing_time),
            results,
            error: None,
        }
    }

    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: Some(MessageType::Error),
            timestamp: Some(cmon_common::time::unix_seconds()),
            processing_time: None,
            results: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// Failure reported by the detector itself
    pub fn failure_message(&self) -> Option<&str> {
        match (&self.error, self.kind) {
            (Some(message), _) => Some(message.as_str()),
            (None, Some(MessageType::Error)) => Some("detector reported an error"),
            _ => None,
        }
    }

    /// A response that names neither a request nor an error cannot be used
    pub fn is_well_formed(&self) -> bool {
        self.id.is_some() || self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let frame = FramePayload {
            shape: vec![2, 2, 3],
            dtype: "uint8".to_string(),
            data: "iVBORw0K".to_string(),
        };
        let request = ChannelRequest::frame_pair("req-1", frame.clone(), frame, Map::new());
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["type"], "process_frame_pair");
        assert_eq!(value["current_frame"]["shape"], json!([2, 2, 3]));
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);

        let shutdown = serde_json::to_value(ChannelRequest::shutdown("s")).unwrap();
        assert!(shutdown.get("current_frame").is_none());
    }

    #[test]
    fn test_response_variants_parse() {
        let ok: ChannelResponse = serde_json::from_value(json!({
            "id": "req-1",
            "type": "result",
            "timestamp": 1.0,
            "processing_time": 0.25,
            "results": [{
                "error_type": "prop_moved",
                "confidence": 0.9,
                "location": {"x": 1, "y": 2, "width": 3, "height": 4},
                "description": "Cup moved",
                "details": {"delta": 12},
                "timestamp": 1.0
            }]
        }))
        .unwrap();
        assert!(ok.is_well_formed());
        assert!(ok.failure_message().is_none());
        assert_eq!(ok.results[0].description, "Cup moved");

        let err: ChannelResponse = serde_json::from_value(json!({"error": "model load failed"})).unwrap();
        assert!(err.is_well_formed());
        assert_eq!(err.failure_message(), Some("model load failed"));

        let junk: ChannelResponse = serde_json::from_value(json!({"results": []})).unwrap();
        assert!(!junk.is_well_formed());
    }
}
