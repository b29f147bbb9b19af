//! Pipeline Configuration
//!
//! Sizing knobs consulted by the caller and enforced by the pipeline.

use std::time::Duration;

use crate::image::PixelFormat;

/// Decode pipeline configuration.
///
/// `max_frame_buffers` caps GPU memory: the pool never holds more live
/// buffers than this, and a slow consumer backpressures the decoder
/// instead of growing the pool.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames that must accumulate in the output queue before presentation
    /// may begin.
    pub preroll_frame_count: usize,
    /// Maximum time presentation waits for preroll before proceeding with
    /// whatever is available.
    pub preroll_timeout: Duration,
    /// Upper bound on decoded images held across the output queue and
    /// outstanding presenting targets.
    pub max_cached_frames: usize,
    /// Upper bound on live GPU frame buffers in the pool.
    pub max_frame_buffers: usize,
    /// Plane format for pool buffers (8-bit vs 10-bit content).
    pub pixel_format: PixelFormat,
    /// Whether the stream carries HDR color metadata.
    pub is_hdr_video: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preroll_frame_count: 4,
            preroll_timeout: Duration::from_millis(500),
            max_cached_frames: 12,
            max_frame_buffers: 24,
            pixel_format: PixelFormat::Yuv420,
            is_hdr_video: false,
        }
    }
}

impl PipelineConfig {
    /// Config for 10-bit HDR streams: 10-bit planes and HDR metadata latching.
    pub fn hdr() -> Self {
        Self {
            pixel_format: PixelFormat::Yuv420p10,
            is_hdr_video: true,
            ..Self::default()
        }
    }
}
