//! GPU Decode Pipeline
//!
//! Orchestration core for hardware-accelerated video decoding: a
//! backpressured pool of GPU-backed frame buffers, a decode state machine
//! driven from a dedicated worker thread, and the cross-thread queues and
//! reference-counted image lifetimes that connect decoder output to
//! presentation without copying pixel data.
//!
//! The concrete codec, the graphics API and the window system stay outside
//! the crate, reached through three narrow seams:
//! - [`CodecAdapter`] invokes the hardware codec session
//! - [`GpuBufferFactory`] creates the native plane textures
//! - [`RenderContextQueue`] is drained by the context that owns the device
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use gpu_decode_pipeline::*;
//! # fn demo(codec: Box<dyn CodecAdapter>, factory: Arc<dyn GpuBufferFactory>) {
//! let config = PipelineConfig::default();
//! let pool = Arc::new(FrameBufferPool::new(
//!     factory,
//!     config.pixel_format,
//!     config.max_frame_buffers,
//! ));
//! let render_context = Arc::new(RenderContextQueue::new());
//! let pipeline = DecodePipeline::new(config, codec, pool, render_context.clone());
//!
//! pipeline
//!     .initialize(Box::new(|_event| {}), Box::new(|e| eprintln!("{e}")))
//!     .unwrap();
//! pipeline
//!     .write_input_buffers(vec![InputBuffer::key_frame(vec![0u8; 128], 0)])
//!     .unwrap();
//!
//! // On the render thread, each frame:
//! if let Some(target) = pipeline.get_current_decode_target() {
//!     let _ = target.image().texture(0);
//! }
//! render_context.run_pending();
//! # }
//! ```

mod buffer;
mod codec;
mod config;
mod error;
mod image;
mod input;
mod pipeline;
mod present;
mod queues;

pub use buffer::{FrameBuffer, FrameBufferPool, GpuBufferFactory, PlaneTexture, PoolStats, NUM_PLANES};
pub use codec::CodecAdapter;
pub use config::PipelineConfig;
pub use error::{DecoderError, Result};
pub use image::{
    ColorMetadata, ColorRange, ColorSpace, DecodedImage, ImageInfo, PixelFormat, PlaneLayout,
    ReleaseHook, TransferFunction,
};
pub use input::InputBuffer;
pub use pipeline::{
    DecodePipeline, ErrorCallback, PipelineEvent, PipelineState, StatusCallback,
};
pub use present::{PresentationBridge, PresentingTarget, RenderContextQueue};
