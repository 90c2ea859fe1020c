//! Data model shared by the detector host layers

pub mod job;
pub mod manifest;
pub mod message;
pub mod result;

pub use job::{FramePairJob, JobFingerprint};
pub use manifest::{
    validate_detector_name, ConfigSchema, DetectorManifest, DetectorVersion, DockerSettings,
    FieldSpec, FieldType,
};
pub use message::{ChannelRequest, ChannelResponse, FramePayload, MessageType, RawFinding};
pub use result::{BoundingBox, DetectionResult, FAILED_CONFIDENCE};
