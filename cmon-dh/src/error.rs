//! Error types for cmon-dh
//!
//! One taxonomy for every public operation of the detector host. Layer-local
//! errors ([`RuntimeError`](crate::runtime::RuntimeError),
//! [`ChannelError`](crate::channel::ChannelError)) convert into it at the
//! layer boundary.

use std::time::Duration;
use thiserror::Error;

/// Detector host error type
#[derive(Debug, Error)]
pub enum DetectorError {
    /// Bad manifest, bad package layout, or bad host configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Security scan failure or archive path traversal
    #[error("Security violation: {message}{}", format_issues(.issues))]
    SecurityViolation {
        message: String,
        issues: Vec<String>,
    },

    /// Container engine is not reachable
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Detector did not answer within the allotted time
    #[error("Detector '{detector}' timed out after {:.1}s", .waited.as_secs_f64())]
    Timeout { detector: String, waited: Duration },

    /// Detector container crashed or its loop failed
    #[error("Detector '{detector}' process error: {reason}")]
    Process { detector: String, reason: String },

    /// Work was abandoned because its detector was stopped
    #[error("Request to detector '{0}' was cancelled")]
    Cancelled(String),

    /// Cached content disagrees with freshly supplied content
    #[error("Cache inconsistency for {fingerprint}: cached {cached}, supplied {supplied}")]
    CacheInconsistency {
        fingerprint: String,
        cached: String,
        supplied: String,
    },

    /// Invalid caller input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested detector or resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// File I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// cmon-common error
    #[error("Common error: {0}")]
    Common(#[from] cmon_common::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_issues(issues: &[String]) -> String {
    if issues.is_empty() {
        String::new()
    } else {
        format!(" [{}]", issues.join("; "))
    }
}

impl DetectorError {
    /// Convenience constructor for a security violation with an issue list
    pub fn security(message: impl Into<String>, issues: Vec<String>) -> Self {
        DetectorError::SecurityViolation {
            message: message.into(),
            issues,
        }
    }

    pub fn process(detector: impl Into<String>, reason: impl Into<String>) -> Self {
        DetectorError::Process {
            detector: detector.into(),
            reason: reason.into(),
        }
    }

    /// True for the "engine unavailable" degradation case
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DetectorError::RuntimeUnavailable(_))
    }
}

impl From<serde_json::Error> for DetectorError {
    fn from(err: serde_json::Error) -> Self {
        DetectorError::Configuration(format!("Invalid JSON: {}", err))
    }
}

/// Convenience Result type using DetectorError
pub type Result<T> = std::result::Result<T, DetectorError>;
