//! Frame-pair jobs and their fingerprints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dedup and cache key: (detector, current take, frame)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobFingerprint {
    pub detector_name: String,
    pub current_take_id: i64,
    pub frame_id: i64,
}

impl JobFingerprint {
    pub fn new(detector_name: impl Into<String>, current_take_id: i64, frame_id: i64) -> Self {
        Self {
            detector_name: detector_name.into(),
            current_take_id,
            frame_id,
        }
    }
}

impl fmt::Display for JobFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/take-{}/frame-{}",
            self.detector_name, self.current_take_id, self.frame_id
        )
    }
}

/// One unit of scheduled detector work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePairJob {
    pub detector_name: String,
    pub reference_take_id: i64,
    pub current_take_id: i64,
    pub frame_id: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Lower is more urgent, in `[0, 1]`
    pub priority: f64,
    /// Within the boundary window of the take; never evicted
    pub boundary: bool,
}

impl FramePairJob {
    pub fn fingerprint(&self) -> JobFingerprint {
        JobFingerprint::new(&self.detector_name, self.current_take_id, self.frame_id)
    }
}
