//! Captured frame access
//!
//! The capture subsystem stores frames as PNG files; the scheduler only
//! needs the bytes of one frame and its position within its take.

use crate::error::{DetectorError, Result};
use crate::models::FramePayload;
use async_trait::async_trait;
use base64::Engine;
use std::path::PathBuf;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Where a frame sits inside its take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePosition {
    /// Zero-based index within the take
    pub index: i64,
    /// Frames in the take
    pub total: i64,
}

/// Source of captured frame images
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// PNG bytes of `frame_id` in `take_id`
    async fn load_png(&self, take_id: i64, frame_id: i64) -> Result<Vec<u8>>;

    /// Position of the frame, when the take's length is known
    async fn position(&self, take_id: i64, frame_id: i64) -> Option<FramePosition>;
}

/// `[height, width, channels]` from a PNG's IHDR chunk
pub fn png_shape(bytes: &[u8]) -> Result<[u32; 3]> {
    if bytes.len() < 26 || bytes[..8] != PNG_SIGNATURE || &bytes[12..16] != b"IHDR" {
        return Err(DetectorError::Validation("frame is not a PNG image".to_string()));
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    let channels = match bytes[25] {
        0 => 1, // grayscale
        2 => 3, // RGB
        3 => 3, // palette, decoded to RGB
        4 => 2, // grayscale + alpha
        6 => 4, // RGBA
        other => {
            return Err(DetectorError::Validation(format!(
                "unsupported PNG colour type {}",
                other
            )))
        }
    };
    let depth = bytes[24];
    if depth != 8 && depth != 16 {
        return Err(DetectorError::Validation(format!("unsupported PNG bit depth {}", depth)));
    }
    Ok([height, width, channels])
}

/// Wrap PNG bytes as a wire payload
pub fn encode_payload(png: &[u8]) -> Result<FramePayload> {
    let shape = png_shape(png)?;
    let dtype = if png[24] == 16 { "uint16" } else { "uint8" };
    Ok(FramePayload {
        shape: shape.to_vec(),
        dtype: dtype.to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(png),
    })
}

/// Frames stored as `<root>/<take_id>/<frame_id>.png`
#[derive(Debug, Clone)]
pub struct DirectoryFrameSource {
    root: PathBuf,
}

impl DirectoryFrameSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn frame_path(&self, take_id: i64, frame_id: i64) -> PathBuf {
        self.root
            .join(take_id.to_string())
            .join(format!("{}.png", frame_id))
    }

    async fn frame_ids(&self, take_id: i64) -> std::io::Result<Vec<i64>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(take_id.to_string())).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".png")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<i64>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

#[async_trait]
impl FrameSource for DirectoryFrameSource {
    async fn load_png(&self, take_id: i64, frame_id: i64) -> Result<Vec<u8>> {
        let path = self.frame_path(take_id, frame_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DetectorError::NotFound(format!(
                "frame {} of take {}",
                frame_id, take_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn position(&self, take_id: i64, frame_id: i64) -> Option<FramePosition> {
        let ids = self.frame_ids(take_id).await.ok()?;
        let index = ids.binary_search(&frame_id).ok()?;
        Some(FramePosition {
            index: index as i64,
            total: ids.len() as i64,
        })
    }
}
