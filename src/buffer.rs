//! Frame Buffer Pool
//!
//! GPU-backed, multi-plane frame buffers with resolution-aware reuse.
//! Buffers are created through an external [`GpuBufferFactory`], leased to
//! the decoder, shared with presentation, and returned to the idle set when
//! the last reference drops. Acquisition blocks (condition wait, not a busy
//! loop) once the configured buffer cap is reached, which is what keeps a
//! slow renderer from growing GPU memory without bound.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{DecoderError, Result};
use crate::image::PixelFormat;

/// Planes per frame buffer: one luma plane and two half-resolution chroma
/// planes (4:2:0).
pub const NUM_PLANES: usize = 3;

/// One native GPU texture backing a single plane.
///
/// Texture data is written once by the codec and read by presentation,
/// never mutated in place, so sharing across threads needs no per-pixel
/// locking. Dropping the box destroys the native object.
pub trait PlaneTexture: Send + Sync {
    fn width(&self) -> u16;
    fn height(&self) -> u16;
    /// Access to the concrete texture type for the renderer.
    fn as_any(&self) -> &dyn Any;
}

/// Creates the native plane textures backing a [`FrameBuffer`].
///
/// Implemented by the graphics layer. Must be callable off the decode
/// thread: the pool invokes it from whichever thread hits `acquire` first
/// for a new resolution.
pub trait GpuBufferFactory: Send + Sync {
    fn create_plane(
        &self,
        width: u16,
        height: u16,
        format: PixelFormat,
    ) -> Result<Box<dyn PlaneTexture>>;
}

/// A 3-plane GPU frame buffer at a fixed resolution.
///
/// Dimensions never change after creation; the pool keys reuse on
/// (width, height).
pub struct FrameBuffer {
    width: u16,
    height: u16,
    format: PixelFormat,
    planes: [Box<dyn PlaneTexture>; NUM_PLANES],
}

impl FrameBuffer {
    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Plane texture by index. An out-of-range index is a contract
    /// violation, not a recoverable error.
    pub fn plane(&self, index: usize) -> &dyn PlaneTexture {
        assert!(index < NUM_PLANES, "plane index {index} out of range");
        &*self.planes[index]
    }

    /// Plane dimensions for a 4:2:0 layout: full-size luma, half-size chroma.
    pub fn plane_dimensions(width: u16, height: u16, index: usize) -> (u16, u16) {
        assert!(index < NUM_PLANES, "plane index {index} out of range");
        if index == 0 {
            (width, height)
        } else {
            (width.div_ceil(2), height.div_ceil(2))
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

struct PoolInner {
    idle: VecDeque<Arc<FrameBuffer>>,
    /// Buffers created and not yet destroyed, leased or idle.
    live: usize,
    created: u64,
    reused: u64,
    shut_down: bool,
}

/// Pool statistics, for logging and tests.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
}

/// Owns all GPU frame buffers for one pipeline instance.
///
/// Explicitly constructed at pipeline creation and cleared at teardown;
/// there is no process-wide pool.
pub struct FrameBufferPool {
    factory: Arc<dyn GpuBufferFactory>,
    format: PixelFormat,
    max_buffers: usize,
    inner: Mutex<PoolInner>,
    released: Condvar,
}

enum AcquirePlan {
    Reuse(Arc<FrameBuffer>),
    Create,
    Evict(Arc<FrameBuffer>),
}

impl FrameBufferPool {
    pub fn new(factory: Arc<dyn GpuBufferFactory>, format: PixelFormat, max_buffers: usize) -> Self {
        assert!(max_buffers > 0, "pool requires a nonzero buffer cap");
        Self {
            factory,
            format,
            max_buffers,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                live: 0,
                created: 0,
                reused: 0,
                shut_down: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Lease a buffer of the given resolution.
    ///
    /// Reuses a matching idle buffer when one exists. Otherwise allocates,
    /// unless the pool is at its cap, in which case one idle buffer of a
    /// stale resolution is destroyed to make room; with nothing idle the
    /// call blocks until a buffer is released or the pool is cleared.
    pub fn acquire(&self, width: u16, height: u16) -> Result<Arc<FrameBuffer>> {
        loop {
            let plan = {
                let mut inner = self.inner.lock();
                loop {
                    if inner.shut_down {
                        return Err(DecoderError::ResourceExhaustion(
                            "frame buffer pool has been cleared".into(),
                        ));
                    }
                    if let Some(pos) = inner
                        .idle
                        .iter()
                        .position(|b| b.width == width && b.height == height)
                    {
                        let buffer = inner.idle.remove(pos).unwrap();
                        inner.reused += 1;
                        break AcquirePlan::Reuse(buffer);
                    }
                    if inner.live < self.max_buffers {
                        // Reserve the slot before creating off-lock.
                        inner.live += 1;
                        inner.created += 1;
                        break AcquirePlan::Create;
                    }
                    if let Some(pos) = inner
                        .idle
                        .iter()
                        .position(|b| b.width != width || b.height != height)
                    {
                        let stale = inner.idle.remove(pos).unwrap();
                        inner.live -= 1;
                        break AcquirePlan::Evict(stale);
                    }
                    self.released.wait(&mut inner);
                }
            };

            match plan {
                AcquirePlan::Reuse(buffer) => return Ok(buffer),
                AcquirePlan::Create => match self.create_buffer(width, height) {
                    Ok(buffer) => return Ok(Arc::new(buffer)),
                    Err(e) => {
                        warn!("frame buffer allocation failed: {e}");
                        self.inner.lock().live -= 1;
                        self.released.notify_one();
                        return Err(e);
                    }
                },
                AcquirePlan::Evict(stale) => {
                    debug!(
                        "evicting idle {}x{} buffer for {}x{} request",
                        stale.width, stale.height, width, height
                    );
                    drop(stale);
                    // Capacity freed; retry under the lock.
                }
            }
        }
    }

    /// Return a leased buffer to the idle set.
    ///
    /// The caller hands back its (last) reference; the buffer becomes the
    /// head candidate for the next matching `acquire`.
    pub fn release(&self, buffer: Arc<FrameBuffer>) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            inner.live -= 1;
            drop(inner);
            drop(buffer);
            return;
        }
        inner.idle.push_front(buffer);
        drop(inner);
        self.released.notify_one();
    }

    /// Destroy all idle buffers and shut the pool down.
    ///
    /// Wakes every blocked `acquire` so it fails fast instead of hanging.
    /// Buffers still leased are destroyed as they are released.
    pub fn clear_all(&self) {
        let drained: Vec<Arc<FrameBuffer>> = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.live -= inner.idle.len();
            inner.idle.drain(..).collect()
        };
        self.released.notify_all();
        info!("frame buffer pool cleared, {} idle buffers destroyed", drained.len());
        drop(drained);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            live: inner.live,
            idle: inner.idle.len(),
            created: inner.created,
            reused: inner.reused,
        }
    }

    fn create_buffer(&self, width: u16, height: u16) -> Result<FrameBuffer> {
        let plane = |index: usize| -> Result<Box<dyn PlaneTexture>> {
            let (w, h) = FrameBuffer::plane_dimensions(width, height, index);
            self.factory.create_plane(w, h, self.format)
        };
        let planes = [plane(0)?, plane(1)?, plane(2)?];
        debug!("created {}x{} frame buffer ({:?})", width, height, self.format);
        Ok(FrameBuffer {
            width,
            height,
            format: self.format,
            planes,
        })
    }
}
