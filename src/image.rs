//! Decoded Images
//!
//! A [`DecodedImage`] represents one decoded picture. It either references
//! pool memory directly (the common zero-copy path) or owns a compacted
//! copy. Images are shared by reference count between the output queue and
//! presentation; the release hook fires exactly once, when the last
//! reference drops, and is how a leased frame buffer finds its way back to
//! the pool without the decoder knowing about presentation timing.

use std::sync::Arc;

use log::trace;

use crate::buffer::{FrameBuffer, PlaneTexture, NUM_PLANES};

/// Pixel format of pool buffers and decoded pictures.
///
/// Both formats are 3-plane 4:2:0; the 10-bit variant stores samples in
/// 16-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Yuv420,
    Yuv420p10,
}

impl PixelFormat {
    pub fn bit_depth(&self) -> u8 {
        match self {
            PixelFormat::Yuv420 => 8,
            PixelFormat::Yuv420p10 => 10,
        }
    }

    pub fn bytes_per_sample(&self) -> u32 {
        match self {
            PixelFormat::Yuv420 => 1,
            PixelFormat::Yuv420p10 => 2,
        }
    }
}

/// Video color range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    /// Limited range (16-235 for Y, 16-240 for UV) - Standard for TV/Video
    #[default]
    Limited,
    /// Full range (0-255) - Standard for PC/JPEG
    Full,
}

/// Video color space (matrix coefficients)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    /// BT.709 (HDTV) - Default
    #[default]
    BT709,
    /// BT.601 (SDTV)
    BT601,
    /// BT.2020 (UHDTV)
    BT2020,
}

/// Video transfer function (EOTF)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferFunction {
    /// SDR gamma (~2.4) - BT.709/BT.601/sRGB
    #[default]
    Sdr,
    /// HDR PQ (Perceptual Quantizer) - SMPTE ST 2084 / HDR10
    Pq,
    /// HDR HLG (Hybrid Log-Gamma) - ARIB STD-B67
    Hlg,
}

/// Color metadata attached to a decoded picture.
///
/// Interpreted by the renderer, carried opaquely here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorMetadata {
    pub range: ColorRange,
    pub space: ColorSpace,
    pub transfer: TransferFunction,
}

impl ColorMetadata {
    pub fn is_hdr(&self) -> bool {
        matches!(self.transfer, TransferFunction::Pq | TransferFunction::Hlg)
    }
}

/// Per-plane crop offsets and strides of a decoded picture.
///
/// Hardware decoders emit pictures inside padded surfaces; the offsets
/// locate the visible region within each plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneLayout {
    pub offsets_left: [i32; NUM_PLANES],
    pub offsets_top: [i32; NUM_PLANES],
    pub strides: [u32; NUM_PLANES],
}

impl PlaneLayout {
    /// Tight layout for an uncropped picture of the given format.
    pub fn packed(width: u32, format: PixelFormat) -> Self {
        let luma = width * format.bytes_per_sample();
        let chroma = width.div_ceil(2) * format.bytes_per_sample();
        Self {
            offsets_left: [0; NUM_PLANES],
            offsets_top: [0; NUM_PLANES],
            strides: [luma, chroma, chroma],
        }
    }
}

/// Picture attributes shared by both image constructors.
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    /// Presentation timestamp in microseconds.
    pub timestamp_us: i64,
    pub color: ColorMetadata,
}

/// Invoked with the underlying buffer lease when the last image reference
/// drops.
pub type ReleaseHook = Box<dyn FnOnce(Arc<FrameBuffer>) + Send + Sync + 'static>;

/// One decoded picture.
///
/// Hold it as `Arc<DecodedImage>`; the lifetime is that of the longest
/// holder, and the release hook runs exactly once regardless of which
/// thread drops last.
pub struct DecodedImage {
    info: ImageInfo,
    layout: PlaneLayout,
    is_compacted: bool,
    buffer: Option<Arc<FrameBuffer>>,
    release: Option<ReleaseHook>,
}

impl DecodedImage {
    /// Picture referencing pool memory directly. `release` receives the
    /// buffer lease when the last reference drops.
    pub fn from_pool_buffer(
        buffer: Arc<FrameBuffer>,
        layout: PlaneLayout,
        info: ImageInfo,
        release: ReleaseHook,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            layout,
            is_compacted: false,
            buffer: Some(buffer),
            release: Some(release),
        })
    }

    /// Picture copied into a dense buffer, with no pool backing.
    pub fn compacted(layout: PlaneLayout, info: ImageInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            layout,
            is_compacted: true,
            buffer: None,
            release: None,
        })
    }

    /// The standard release hook: return the lease to `pool`.
    pub fn release_to(pool: &Arc<crate::buffer::FrameBufferPool>) -> ReleaseHook {
        let pool = Arc::clone(pool);
        Box::new(move |buffer| pool.release(buffer))
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn bit_depth(&self) -> u8 {
        self.info.bit_depth
    }

    pub fn timestamp_us(&self) -> i64 {
        self.info.timestamp_us
    }

    pub fn color_metadata(&self) -> ColorMetadata {
        self.info.color
    }

    /// Whether the picture was copied into a dense buffer instead of
    /// referencing pool memory.
    pub fn is_compacted(&self) -> bool {
        self.is_compacted
    }

    pub fn offset_left(&self, index: usize) -> i32 {
        assert!(index < NUM_PLANES, "plane index {index} out of range");
        self.layout.offsets_left[index]
    }

    pub fn offset_top(&self, index: usize) -> i32 {
        assert!(index < NUM_PLANES, "plane index {index} out of range");
        self.layout.offsets_top[index]
    }

    pub fn stride(&self, index: usize) -> u32 {
        assert!(index < NUM_PLANES, "plane index {index} out of range");
        self.layout.strides[index]
    }

    /// Backing plane texture, `None` for compacted images.
    pub fn texture(&self, index: usize) -> Option<&dyn PlaneTexture> {
        assert!(index < NUM_PLANES, "plane index {index} out of range");
        self.buffer.as_ref().map(|b| b.plane(index))
    }
}

impl Drop for DecodedImage {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Some(release) = self.release.take() {
                trace!("releasing {}x{} image at pts {}", self.info.width, self.info.height, self.info.timestamp_us);
                release(buffer);
            }
        }
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.info.width)
            .field("height", &self.info.height)
            .field("timestamp_us", &self.info.timestamp_us)
            .field("is_compacted", &self.is_compacted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{FrameBufferPool, GpuBufferFactory};
    use crate::error::Result;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct NullPlane {
        width: u16,
        height: u16,
    }

    impl PlaneTexture for NullPlane {
        fn width(&self) -> u16 {
            self.width
        }
        fn height(&self) -> u16 {
            self.height
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct NullFactory;

    impl GpuBufferFactory for NullFactory {
        fn create_plane(
            &self,
            width: u16,
            height: u16,
            _format: PixelFormat,
        ) -> Result<Box<dyn PlaneTexture>> {
            Ok(Box::new(NullPlane { width, height }))
        }
    }

    fn test_image(hook: ReleaseHook) -> Arc<DecodedImage> {
        let pool = Arc::new(FrameBufferPool::new(
            Arc::new(NullFactory),
            PixelFormat::Yuv420,
            2,
        ));
        let buffer = pool.acquire(64, 64).unwrap();
        DecodedImage::from_pool_buffer(
            buffer,
            PlaneLayout::packed(64, PixelFormat::Yuv420),
            ImageInfo {
                width: 64,
                height: 64,
                bit_depth: 8,
                timestamp_us: 0,
                color: ColorMetadata::default(),
            },
            hook,
        )
    }

    #[test]
    fn test_release_hook_fires_exactly_once_across_threads() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let image = test_image(Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        // Two holders, dropped from two different threads in either order.
        let a = image.clone();
        let b = image;
        let ta = thread::spawn(move || drop(a));
        let tb = thread::spawn(move || drop(b));
        ta.join().unwrap();
        tb.join().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_does_not_fire_while_references_remain() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let image = test_image(Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        let held = image.clone();
        drop(image);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(held);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_compacted_image_has_no_texture() {
        let image = DecodedImage::compacted(
            PlaneLayout::packed(32, PixelFormat::Yuv420),
            ImageInfo {
                width: 32,
                height: 32,
                bit_depth: 8,
                timestamp_us: 40_000,
                color: ColorMetadata::default(),
            },
        );
        assert!(image.is_compacted());
        assert!(image.texture(0).is_none());
        assert_eq!(image.timestamp_us(), 40_000);
    }

    #[test]
    #[should_panic(expected = "plane index")]
    fn test_out_of_range_plane_index_panics() {
        let image = DecodedImage::compacted(
            PlaneLayout::packed(32, PixelFormat::Yuv420),
            ImageInfo {
                width: 32,
                height: 32,
                bit_depth: 8,
                timestamp_us: 0,
                color: ColorMetadata::default(),
            },
        );
        image.stride(NUM_PLANES);
    }

    #[test]
    fn test_packed_layout_strides() {
        let layout = PlaneLayout::packed(1920, PixelFormat::Yuv420p10);
        assert_eq!(layout.strides, [3840, 1920, 1920]);
    }
}
