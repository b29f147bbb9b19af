//! Cross-Thread Queues
//!
//! The three hand-off points of the pipeline, each guarded by its own lock
//! so submission, decode and presentation never contend on shared state
//! they do not touch. All access follows a "lock, move out, unlock,
//! process" discipline; no lock is held across codec or GPU work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::image::DecodedImage;
use crate::input::InputBuffer;

/// Pending encoded units: caller thread pushes, decoder thread pops (FIFO).
///
/// Decode order matches submission order; no reordering buffer exists at
/// this layer.
pub struct InputQueue {
    pending: Mutex<VecDeque<InputBuffer>>,
    available: Condvar,
}

impl InputQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn push_all(&self, inputs: Vec<InputBuffer>) {
        let mut pending = self.pending.lock();
        pending.extend(inputs);
        drop(pending);
        self.available.notify_all();
    }

    pub fn try_pop(&self) -> Option<InputBuffer> {
        self.pending.lock().pop_front()
    }

    /// Pop the next unit, blocking while the queue is empty and
    /// `keep_waiting` holds. Returns `None` once the predicate turns false;
    /// the caller must re-check pipeline state after every return.
    ///
    /// The predicate is evaluated under the queue lock, so a state change
    /// followed by [`wake_all`](Self::wake_all) cannot slip between the
    /// check and the wait.
    pub fn wait_pop_while(&self, keep_waiting: impl Fn() -> bool) -> Option<InputBuffer> {
        let mut pending = self.pending.lock();
        loop {
            if let Some(input) = pending.pop_front() {
                return Some(input);
            }
            if !keep_waiting() {
                return None;
            }
            self.available.wait(&mut pending);
        }
    }

    /// Discard all pending units (reset path) and wake the consumer.
    pub fn clear(&self) -> usize {
        let drained: VecDeque<InputBuffer> = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        let count = drained.len();
        if count > 0 {
            debug!("flushed {count} pending input buffers");
        }
        self.available.notify_all();
        count
    }

    /// Wake the consumer so it re-checks pipeline state.
    pub fn wake_all(&self) {
        let _pending = self.pending.lock();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Units handed to the codec but not yet confirmed consumed.
///
/// Needed for flush semantics: on reset, anything still here is discarded
/// along with the codec's in-flight state.
pub struct WrittenQueue {
    inner: Mutex<Vec<InputBuffer>>,
}

impl WrittenQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, input: InputBuffer) {
        self.inner.lock().push(input);
    }

    /// Confirm the unit with the given timestamp as consumed by the codec.
    pub fn confirm(&self, timestamp_us: i64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.iter().position(|b| b.timestamp_us() == timestamp_us) {
            inner.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut *self.inner.lock());
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for WrittenQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct OutputInner {
    images: VecDeque<Arc<DecodedImage>>,
    first_push: Option<Instant>,
    preroll_satisfied: bool,
    eos: bool,
}

/// Decoded images: decoder thread pushes, presentation pops (FIFO).
///
/// Timestamps are expected non-decreasing but are not enforced; images are
/// handed out in production order either way. Presentation is gated by the
/// preroll contract: nothing is handed out until `preroll_count` images
/// accumulated, the preroll timeout elapsed since the first push, or the
/// stream ended. Once satisfied, preroll stays satisfied for the session.
pub struct OutputQueue {
    inner: Mutex<OutputInner>,
    changed: Condvar,
    preroll_count: usize,
    preroll_timeout: Duration,
}

impl OutputQueue {
    pub fn new(preroll_count: usize, preroll_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(OutputInner {
                images: VecDeque::new(),
                first_push: None,
                preroll_satisfied: preroll_count == 0,
                eos: false,
            }),
            changed: Condvar::new(),
            preroll_count,
            preroll_timeout,
        }
    }

    /// Append an image in production order. Returns the queue depth after
    /// the push.
    pub fn push(&self, image: Arc<DecodedImage>) -> usize {
        let mut inner = self.inner.lock();
        inner.first_push.get_or_insert_with(Instant::now);
        inner.images.push_back(image);
        let depth = inner.images.len();
        if depth >= self.preroll_count {
            inner.preroll_satisfied = true;
        }
        drop(inner);
        self.changed.notify_all();
        depth
    }

    /// Non-blocking: the oldest ready image, or `None` while empty or still
    /// prerolling.
    pub fn poll_ready(&self) -> Option<Arc<DecodedImage>> {
        let popped = {
            let mut inner = self.inner.lock();
            if !inner.preroll_satisfied {
                let timed_out = inner
                    .first_push
                    .is_some_and(|t| t.elapsed() >= self.preroll_timeout);
                if timed_out {
                    debug!("preroll timeout elapsed, presenting with {} frames", inner.images.len());
                    inner.preroll_satisfied = true;
                } else {
                    return None;
                }
            }
            inner.images.pop_front()
        };
        if popped.is_some() {
            // A slot opened up; wake a producer blocked on backpressure.
            self.changed.notify_all();
        }
        popped
    }

    /// Mark end-of-stream: whatever is queued becomes presentable.
    pub fn mark_eos(&self) {
        let mut inner = self.inner.lock();
        inner.eos = true;
        inner.preroll_satisfied = true;
        drop(inner);
        self.changed.notify_all();
    }

    pub fn is_eos(&self) -> bool {
        self.inner.lock().eos
    }

    /// Drop all queued images (firing their release hooks) and start a
    /// fresh preroll cycle. Wakes every waiter.
    pub fn clear(&self) -> usize {
        let drained: VecDeque<Arc<DecodedImage>> = {
            let mut inner = self.inner.lock();
            inner.first_push = None;
            inner.preroll_satisfied = self.preroll_count == 0;
            inner.eos = false;
            std::mem::take(&mut inner.images)
        };
        self.changed.notify_all();
        let count = drained.len();
        if count > 0 {
            trace!("dropping {count} queued decoded images");
        }
        // Release hooks run here, outside the queue lock.
        drop(drained);
        count
    }

    /// Block until `ready(queue_depth)` holds or `keep_waiting` turns
    /// false. Decode-side backpressure: the producer parks here while the
    /// consumer lags.
    pub fn wait_until(
        &self,
        ready: impl Fn(usize) -> bool,
        keep_waiting: impl Fn() -> bool,
    ) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if ready(inner.images.len()) {
                return true;
            }
            if !keep_waiting() {
                return false;
            }
            self.changed.wait(&mut inner);
        }
    }

    /// Wake waiters without changing the queue, e.g. when an outstanding
    /// presenting target is retired and decode capacity opens up.
    pub fn poke(&self) {
        let _inner = self.inner.lock();
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ColorMetadata, ImageInfo, PixelFormat, PlaneLayout};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn image(timestamp_us: i64) -> Arc<DecodedImage> {
        DecodedImage::compacted(
            PlaneLayout::packed(64, PixelFormat::Yuv420),
            ImageInfo {
                width: 64,
                height: 64,
                bit_depth: 8,
                timestamp_us,
                color: ColorMetadata::default(),
            },
        )
    }

    #[test]
    fn test_input_queue_is_fifo() {
        let queue = InputQueue::new();
        queue.push_all(vec![
            InputBuffer::new(vec![1u8], 0),
            InputBuffer::new(vec![2u8], 1),
        ]);
        assert_eq!(queue.try_pop().unwrap().timestamp_us(), 0);
        assert_eq!(queue.try_pop().unwrap().timestamp_us(), 1);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_wait_pop_returns_none_when_predicate_clears() {
        let queue = Arc::new(InputQueue::new());
        let stop = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let s = stop.clone();
        let waiter = thread::spawn(move || q.wait_pop_while(|| s.load(Ordering::SeqCst) == 0));

        thread::sleep(Duration::from_millis(30));
        stop.store(1, Ordering::SeqCst);
        queue.wake_all();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_written_queue_confirms_by_timestamp() {
        let queue = WrittenQueue::new();
        queue.record(InputBuffer::new(vec![1u8], 100));
        queue.record(InputBuffer::new(vec![2u8], 200));
        assert!(queue.confirm(100));
        assert!(!queue.confirm(100));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.clear(), 1);
    }

    #[test]
    fn test_preroll_gates_until_count_reached() {
        let queue = OutputQueue::new(3, Duration::from_secs(60));
        queue.push(image(0));
        queue.push(image(1));
        assert!(queue.poll_ready().is_none());
        queue.push(image(2));
        assert_eq!(queue.poll_ready().unwrap().timestamp_us(), 0);
        // Satisfaction is sticky: depth dropping below preroll changes nothing.
        assert_eq!(queue.poll_ready().unwrap().timestamp_us(), 1);
    }

    #[test]
    fn test_preroll_timeout_unblocks_presentation() {
        let queue = OutputQueue::new(3, Duration::from_millis(20));
        queue.push(image(0));
        assert!(queue.poll_ready().is_none());
        thread::sleep(Duration::from_millis(40));
        assert_eq!(queue.poll_ready().unwrap().timestamp_us(), 0);
    }

    #[test]
    fn test_eos_makes_short_stream_presentable() {
        let queue = OutputQueue::new(5, Duration::from_secs(60));
        queue.push(image(0));
        assert!(queue.poll_ready().is_none());
        queue.mark_eos();
        assert!(queue.poll_ready().is_some());
    }

    #[test]
    fn test_clear_fires_release_hooks_and_restarts_preroll() {
        use crate::buffer::{FrameBufferPool, GpuBufferFactory, PlaneTexture};
        use crate::error::Result;
        use std::any::Any;

        struct P(u16, u16);
        impl PlaneTexture for P {
            fn width(&self) -> u16 {
                self.0
            }
            fn height(&self) -> u16 {
                self.1
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }
        struct F;
        impl GpuBufferFactory for F {
            fn create_plane(
                &self,
                width: u16,
                height: u16,
                _format: PixelFormat,
            ) -> Result<Box<dyn PlaneTexture>> {
                Ok(Box::new(P(width, height)))
            }
        }

        let pool = Arc::new(FrameBufferPool::new(Arc::new(F), PixelFormat::Yuv420, 2));
        let released = Arc::new(AtomicUsize::new(0));
        let queue = OutputQueue::new(1, Duration::from_secs(60));

        let buffer = pool.acquire(64, 64).unwrap();
        let released2 = released.clone();
        queue.push(DecodedImage::from_pool_buffer(
            buffer,
            PlaneLayout::packed(64, PixelFormat::Yuv420),
            ImageInfo {
                width: 64,
                height: 64,
                bit_depth: 8,
                timestamp_us: 0,
                color: ColorMetadata::default(),
            },
            Box::new(move |_| {
                released2.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        assert_eq!(queue.clear(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(queue.poll_ready().is_none());
    }

    #[test]
    fn test_wait_until_observes_consumer_progress() {
        let queue = Arc::new(OutputQueue::new(0, Duration::from_secs(60)));
        for i in 0..4 {
            queue.push(image(i));
        }

        let q = queue.clone();
        let producer = thread::spawn(move || q.wait_until(|depth| depth < 3, || true));

        thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());
        queue.poll_ready().unwrap();
        queue.poll_ready().unwrap();
        assert!(producer.join().unwrap());
    }
}
