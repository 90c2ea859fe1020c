//! Frame position priority
//!
//! Score in `[0, 1]`, lower is more urgent. Frames within the boundary
//! window of either end of a take sit in `[0, 0.1)`; the score then rises
//! linearly to 1.0 at the middle of the take.
//!
//! ```text
//! score
//!  1.0 |            /\
//!      |          /    \
//!  0.1 |  ______/        \______
//!  0.0 |_/                      \_
//!      0   w             N-1-w   N-1
//! ```

/// Score assigned to boundary frames stays below this
pub const BOUNDARY_BAND: f64 = 0.1;

/// Position-derived priority of one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramePriority {
    pub score: f64,
    pub boundary: bool,
}

/// Priority of `frame_index` in a take of `total_frames`
///
/// Indices outside `0..total_frames` are clamped. `window` is the boundary
/// width at each end.
pub fn frame_priority(frame_index: i64, total_frames: i64, window: u32) -> FramePriority {
    let total = total_frames.max(1);
    let index = frame_index.clamp(0, total - 1);
    let distance = index.min(total - 1 - index);
    let window = i64::from(window);

    if distance < window {
        return FramePriority {
            score: BOUNDARY_BAND * distance as f64 / window as f64,
            boundary: true,
        };
    }

    let middle = (total - 1) / 2;
    let span = (middle - window).max(1);
    let progress = ((distance - window) as f64 / span as f64).min(1.0);
    FramePriority {
        score: BOUNDARY_BAND + (1.0 - BOUNDARY_BAND) * progress,
        boundary: false,
    }
}
