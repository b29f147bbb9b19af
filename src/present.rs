//! Presentation Bridge
//!
//! Converts decoded images into presentable targets and defers all
//! device-bound teardown onto the execution context that owns the GPU
//! device. GPU device objects are generally not safe to destroy from
//! arbitrary threads, so dropping a [`PresentingTarget`] never releases
//! its image inline; the release is posted to the [`RenderContextQueue`]
//! and runs when that context next drains it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::image::{ColorMetadata, DecodedImage};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-consumer deferred-work queue.
///
/// Any thread may post; only the loop of the execution context that owns
/// the GPU device calls [`run_pending`](Self::run_pending).
pub struct RenderContextQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl RenderContextQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn post(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }

    /// Execute everything posted so far. Jobs run outside the queue lock.
    pub fn run_pending(&self) -> usize {
        let drained: VecDeque<Job> = {
            let mut jobs = self.jobs.lock();
            std::mem::take(&mut *jobs)
        };
        let count = drained.len();
        for job in drained {
            job();
        }
        if count > 0 {
            trace!("ran {count} deferred render-context jobs");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

impl Default for RenderContextQueue {
    fn default() -> Self {
        Self::new()
    }
}

type ReleaseListener = Box<dyn Fn() + Send + Sync + 'static>;

/// Binds decoded images to renderer-consumable targets and tracks how many
/// are outstanding, so the decode side can back off when presentation lags.
pub struct PresentationBridge {
    context: Arc<RenderContextQueue>,
    outstanding: Arc<AtomicUsize>,
    listener: Arc<Mutex<Option<ReleaseListener>>>,
    last_color: Mutex<Option<ColorMetadata>>,
    color_update_pending: AtomicUsize,
}

impl PresentationBridge {
    pub fn new(context: Arc<RenderContextQueue>) -> Self {
        Self {
            context,
            outstanding: Arc::new(AtomicUsize::new(0)),
            listener: Arc::new(Mutex::new(None)),
            last_color: Mutex::new(None),
            color_update_pending: AtomicUsize::new(0),
        }
    }

    /// Called (from the render context) every time a target is retired, so
    /// the owner can wake anything parked on saturation.
    pub fn set_release_listener(&self, listener: ReleaseListener) {
        *self.listener.lock() = Some(listener);
    }

    /// Wrap `image` for the renderer.
    pub fn present(&self, image: Arc<DecodedImage>) -> PresentingTarget {
        let color = image.color_metadata();
        {
            let mut last = self.last_color.lock();
            if *last != Some(color) {
                *last = Some(color);
                self.color_update_pending.store(1, Ordering::Release);
                debug!("presented color metadata changed: {color:?}");
            }
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        PresentingTarget {
            image: Some(image),
            context: self.context.clone(),
            outstanding: self.outstanding.clone(),
            listener: self.listener.clone(),
        }
    }

    /// Targets created and not yet destroyed on the render context.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Shared counter handle for the decode-side backpressure check.
    pub fn outstanding_handle(&self) -> Arc<AtomicUsize> {
        self.outstanding.clone()
    }

    /// Whether the renderer needs to re-latch color/HDR metadata since the
    /// last call. Clears the flag.
    pub fn take_color_update(&self) -> Option<ColorMetadata> {
        if self.color_update_pending.swap(0, Ordering::AcqRel) != 0 {
            *self.last_color.lock()
        } else {
            None
        }
    }
}

/// A decoded image bound to a renderer-consumable form.
///
/// Dropping the target does not release the image; the release is deferred
/// to the render context queue.
pub struct PresentingTarget {
    image: Option<Arc<DecodedImage>>,
    context: Arc<RenderContextQueue>,
    outstanding: Arc<AtomicUsize>,
    listener: Arc<Mutex<Option<ReleaseListener>>>,
}

impl PresentingTarget {
    pub fn image(&self) -> &DecodedImage {
        self.image.as_deref().expect("presenting target already retired")
    }

    pub fn width(&self) -> u32 {
        self.image().width()
    }

    pub fn height(&self) -> u32 {
        self.image().height()
    }
}

impl Drop for PresentingTarget {
    fn drop(&mut self) {
        let Some(image) = self.image.take() else {
            return;
        };
        let outstanding = self.outstanding.clone();
        let listener = self.listener.clone();
        self.context.post(Box::new(move || {
            drop(image);
            outstanding.fetch_sub(1, Ordering::SeqCst);
            if let Some(listener) = listener.lock().as_ref() {
                listener();
            }
        }));
    }
}

impl std::fmt::Debug for PresentingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentingTarget")
            .field("image", &self.image)
            .finish()
    }
}
