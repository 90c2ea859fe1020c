//! Automatic recovery of failed detectors
//!
//! Off unless `[manager.recovery] enabled = true`. Listens for detectors
//! entering `error` and performs the same stop + start an operator would,
//! at most `max_restarts` times per detector inside `window_secs`.

use super::ProcessManager;
use crate::config::RecoveryConfig;
use cmon_common::events::{CmonEvent, ProcessState};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Sliding-window restart budget
#[derive(Debug)]
pub struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    history: HashMap<String, VecDeque<Instant>>,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            history: HashMap::new(),
        }
    }

    /// Record a restart attempt at `now` if the budget allows it
    pub fn try_acquire(&mut self, name: &str, now: Instant) -> bool {
        let attempts = self.history.entry(name.to_string()).or_default();
        while let Some(oldest) = attempts.front() {
            if now.duration_since(*oldest) >= self.window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        if attempts.len() as u32 >= self.max_restarts {
            return false;
        }
        attempts.push_back(now);
        true
    }
}

/// Spawn the supervisor; returns `None` when recovery is disabled
pub fn spawn_recovery(
    manager: Arc<ProcessManager>,
    config: RecoveryConfig,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        return None;
    }
    let mut events = manager.events().subscribe();
    let mut budget = RestartBudget::new(config.max_restarts, Duration::from_secs(config.window_secs));
    let backoff = Duration::from_secs(config.backoff_secs);

    Some(tokio::spawn(async move {
        info!(max_restarts = config.max_restarts, window_secs = config.window_secs, "Detector recovery enabled");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let name = match event {
                Ok(CmonEvent::DetectorStateChanged {
                    name,
                    new_state: ProcessState::Error,
                    ..
                }) => name,
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Recovery supervisor lagged behind the event stream");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if !budget.try_acquire(&name, Instant::now()) {
                warn!(detector = %name, "Restart budget exhausted; leaving detector in error state");
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }

            let config = match manager.process(&name).await {
                Some(process) if process.state() == ProcessState::Error => process.config().clone(),
                // Operator already intervened
                _ => continue,
            };
            info!(detector = %name, "Restarting failed detector");
            if let Err(e) = manager.stop_detector(&name).await {
                warn!(detector = %name, error = %e, "Recovery stop failed");
                continue;
            }
            if let Err(e) = manager.start_detector(&name, &config).await {
                warn!(detector = %name, error = %e, "Recovery start failed");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_limits_restarts_within_window() {
        let mut budget = RestartBudget::new(2, Duration::from_secs(60));
        let start = Instant::now();
        assert!(budget.try_acquire("props", start));
        assert!(budget.try_acquire("props", start + Duration::from_secs(1)));
        assert!(!budget.try_acquire("props", start + Duration::from_secs(2)));
        // Other detectors have their own budget
        assert!(budget.try_acquire("lighting", start + Duration::from_secs(2)));
        // Window slides
        assert!(budget.try_acquire("props", start + Duration::from_secs(61)));
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let mut budget = RestartBudget::new(0, Duration::from_secs(60));
        assert!(!budget.try_acquire("props", Instant::now()));
    }
}
