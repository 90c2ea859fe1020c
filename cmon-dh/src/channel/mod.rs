//! Filesystem request/response channel
//!
//! Detector containers have no network, so the only path across the
//! isolation boundary is the bind-mounted communication directory:
//!
//! ```text
//! <comm>/input/   host -> detector   (requests)
//! <comm>/output/  detector -> host   (responses)
//! ```
//!
//! Every message is one JSON file. Writers create a hidden temp file and
//! rename it into place, so readers only ever see complete files. File
//! names are `<millis>-<sequence>-<random>.json`; sorting by name yields
//! submission order.
//!
//! The channel is owned by one detector's communication loop and is not
//! shared; all methods take `&mut self`.

use crate::error::DetectorError;
use crate::models::{ChannelRequest, ChannelResponse, MessageType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "output";

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// input/ or output/ missing when the channel is opened
    #[error("Channel directory missing: {0}")]
    MissingDirectory(PathBuf),

    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<ChannelError> for DetectorError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::MissingDirectory(path) => DetectorError::Configuration(format!(
                "Channel directory missing: {}",
                path.display()
            )),
            ChannelError::Io(e) => DetectorError::Io(e),
            ChannelError::Encode(e) => DetectorError::Internal(format!("Failed to encode message: {}", e)),
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    deadline: Instant,
    input_file: PathBuf,
}

/// Per-detector filesystem channel
#[derive(Debug)]
pub struct SecureChannel {
    detector: String,
    input_dir: PathBuf,
    output_dir: PathBuf,
    default_timeout: Duration,
    sequence: u64,
    pending: HashMap<String, PendingRequest>,
}

impl SecureChannel {
    /// Open the channel rooted at `comm_dir`
    ///
    /// Both `input/` and `output/` must already exist; a missing directory
    /// means the detector was set up wrong and is fatal.
    pub fn open(
        detector: impl Into<String>,
        comm_dir: &Path,
        default_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let input_dir = comm_dir.join(INPUT_DIR);
        let output_dir = comm_dir.join(OUTPUT_DIR);
        for dir in [&input_dir, &output_dir] {
            if !dir.is_dir() {
                return Err(ChannelError::MissingDirectory(dir.clone()));
            }
        }

        Ok(Self {
            detector: detector.into(),
            input_dir,
            output_dir,
            default_timeout,
            sequence: 0,
            pending: HashMap::new(),
        })
    }

    /// True while both channel directories exist
    pub fn directories_present(&self) -> bool {
        self.input_dir.is_dir() && self.output_dir.is_dir()
    }

    /// Write `request` into `input/` and return its correlation id
    ///
    /// Returns as soon as the file is in place. Frame-pair requests are
    /// tracked as pending until a response arrives or `timeout` (default:
    /// the channel timeout) passes.
    pub async fn send(
        &mut self,
        request: &ChannelRequest,
        timeout: Option<Duration>,
    ) -> Result<String, ChannelError> {
        let encoded = serde_json::to_vec(request)?;
        let file_name = self.next_file_name();
        let final_path = self.input_dir.join(&file_name);
        let temp_path = self.input_dir.join(format!(".{}.tmp", file_name));

        tokio::fs::write(&temp_path, &encoded).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if request.kind == MessageType::ProcessFramePair {
            self.pending.insert(
                request.id.clone(),
                PendingRequest {
                    deadline: Instant::now() + timeout.unwrap_or(self.default_timeout),
                    input_file: final_path,
                },
            );
        }

        debug!(
            detector = %self.detector,
            request_id = %request.id,
            file = %file_name,
            "Request written"
        );
        Ok(request.id.clone())
    }

    fn next_file_name(&mut self) -> String {
        self.sequence += 1;
        format!(
            "{:013}-{:08}-{:08x}.json",
            cmon_common::time::unix_millis().max(0),
            self.sequence,
            rand::random::<u32>()
        )
    }

    /// Consume every complete response file in `output/`
    ///
    /// Files are processed in name order and deleted once read. A file that
    /// cannot be read or parsed is logged and deleted; it never blocks the
    /// files after it. Responses that correlate to a pending request clear
    /// that request.
    pub async fn poll_results(&mut self) -> Result<Vec<ChannelResponse>, ChannelError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();

        let mut responses = Vec::with_capacity(names.len());
        for name in names {
            let path = self.output_dir.join(&name);
            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<ChannelResponse>(&bytes)
                    .map_err(|e| e.to_string())
                    .and_then(|response| {
                        if response.is_well_formed() {
                            Ok(response)
                        } else {
                            Err("response has neither id nor error".to_string())
                        }
                    }),
                Err(e) => Err(e.to_string()),
            };

            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(detector = %self.detector, file = %name, error = %e, "Failed to delete response file");
                }
            }

            match parsed {
                Ok(response) => {
                    if let Some(id) = &response.id {
                        self.pending.remove(id);
                    }
                    responses.push(response);
                }
                Err(reason) => {
                    warn!(
                        detector = %self.detector,
                        file = %name,
                        error = %reason,
                        "Discarded corrupt response file"
                    );
                }
            }
        }

        Ok(responses)
    }

    /// Drop pending requests past their deadline and return their ids
    ///
    /// The request file is deleted too so the detector does not pick up
    /// work nobody waits for any more.
    pub async fn expire_stale(&mut self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(pending) = self.pending.remove(id) {
                remove_if_present(&pending.input_file).await;
            }
            debug!(detector = %self.detector, request_id = %id, "Pending request expired");
        }
        expired
    }

    /// Forget a pending request (its caller gave up)
    pub async fn forget(&mut self, id: &str) {
        if let Some(pending) = self.pending.remove(id) {
            remove_if_present(&pending.input_file).await;
        }
    }

    /// Drop every pending request; returns their ids
    pub async fn cancel_all(&mut self) -> Vec<String> {
        let drained: Vec<(String, PendingRequest)> = self.pending.drain().collect();
        let mut ids = Vec::with_capacity(drained.len());
        for (id, pending) in drained {
            remove_if_present(&pending.input_file).await;
            ids.push(id);
        }
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Remove all message files from both directories
    pub async fn cleanup(&mut self) -> Result<(), ChannelError> {
        self.pending.clear();
        for dir in [&self.input_dir, &self.output_dir] {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    remove_if_present(&entry.path()).await;
                }
            }
        }
        Ok(())
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %path.display(), error = %e, "Failed to remove message file");
        }
    }
}
