//! Detector lifecycle type definitions
//!
//! Shared between the detector host (which drives the transitions) and any
//! consumer of the event stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime state of a detector's container and communication loop
///
/// ```text
/// stopped -> starting -> running <-> degraded -> stopping -> stopped
///                        running -> error   (unrecoverable fault)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    /// Liveness checks are failing but the failure threshold is not reached yet
    Degraded,
    Stopping,
    /// Unrecoverable fault; requires an explicit stop + start
    Error,
}

impl ProcessState {
    /// True while the detector can accept frame-pair work
    pub fn accepts_work(&self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Degraded => "degraded",
            ProcessState::Stopping => "stopping",
            ProcessState::Error => "error",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install lifecycle of a detector package
///
/// `uninstalled -> validating -> security_scanned -> built -> registered -> active <-> disabled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStage {
    Uninstalled,
    Validating,
    SecurityScanned,
    Built,
    Registered,
    Active,
    Disabled,
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallStage::Uninstalled => "uninstalled",
            InstallStage::Validating => "validating",
            InstallStage::SecurityScanned => "security_scanned",
            InstallStage::Built => "built",
            InstallStage::Registered => "registered",
            InstallStage::Active => "active",
            InstallStage::Disabled => "disabled",
        };
        f.write_str(name)
    }
}
