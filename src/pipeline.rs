//! Decode Pipeline
//!
//! Drives the codec from a dedicated worker thread and owns the state
//! machine connecting submission, decode and presentation. Callers enqueue
//! encoded units and poll for presentable targets; the worker feeds the
//! codec one unit at a time, pushes decoded images to the output queue and
//! honors drain and reset requests from any thread.
//!
//! Locking discipline: the state lock is never held while acquiring a
//! queue lock, and no lock is held across codec calls or callbacks. Every
//! wait re-checks pipeline state after waking.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::buffer::FrameBufferPool;
use crate::codec::CodecAdapter;
use crate::config::PipelineConfig;
use crate::error::{DecoderError, Result};
use crate::input::InputBuffer;
use crate::present::{PresentationBridge, PresentingTarget, RenderContextQueue};
use crate::queues::{InputQueue, OutputQueue, WrittenQueue};

/// Pipeline state. Exactly one value is active at a time; transitions are
/// serialized under the state lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No decode in progress; ready for input after initialize.
    Stopped,
    /// Worker is consuming the input queue.
    DecodingFrames,
    /// Teardown in progress; input is rejected.
    ResettingDecoder,
    /// End of stream requested; queued input drains, then the codec drains.
    EndingStream,
}

/// Events delivered through the status callback registered at initialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A decoded image entered the output queue.
    FrameReady,
    /// The worker finished a unit and can accept more input.
    NeedsMoreInput,
    /// Drain complete; no further output until reset.
    EndOfStream,
}

pub type StatusCallback = Box<dyn Fn(PipelineEvent) + Send + Sync + 'static>;
pub type ErrorCallback = Box<dyn Fn(DecoderError) + Send + Sync + 'static>;

struct Callbacks {
    status: StatusCallback,
    error: ErrorCallback,
}

struct Shared {
    state: Mutex<PipelineState>,
    state_changed: Condvar,
    input: InputQueue,
    written: WrittenQueue,
    output: OutputQueue,
    error_occurred: AtomicBool,
    eos_written: AtomicBool,
    shutdown: AtomicBool,
    frame_width: AtomicU32,
    frame_height: AtomicU32,
    worker_thread: Mutex<Option<thread::ThreadId>>,
}

impl Shared {
    fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    fn set_state(&self, next: PipelineState) {
        {
            let mut state = self.state.lock();
            if *state != next {
                debug!("pipeline state {:?} -> {:?}", *state, next);
                *state = next;
            }
        }
        self.state_changed.notify_all();
    }

    /// Transition only if the pipeline is still in `from`; a concurrent
    /// reset wins otherwise.
    fn try_transition(&self, from: PipelineState, to: PipelineState) -> bool {
        let moved = {
            let mut state = self.state.lock();
            if *state == from {
                debug!("pipeline state {:?} -> {:?}", from, to);
                *state = to;
                true
            } else {
                false
            }
        };
        if moved {
            self.state_changed.notify_all();
        }
        moved
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// The orchestration core of one hardware decode session.
///
/// Construct with a codec adapter, a frame-buffer pool and the render
/// context's deferred-work queue, then `initialize` to register callbacks
/// and start the worker thread.
pub struct DecodePipeline {
    config: PipelineConfig,
    shared: Arc<Shared>,
    pool: Arc<FrameBufferPool>,
    bridge: PresentationBridge,
    codec: Mutex<Option<Box<dyn CodecAdapter>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl DecodePipeline {
    pub fn new(
        config: PipelineConfig,
        codec: Box<dyn CodecAdapter>,
        pool: Arc<FrameBufferPool>,
        render_context: Arc<RenderContextQueue>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PipelineState::Stopped),
            state_changed: Condvar::new(),
            input: InputQueue::new(),
            written: WrittenQueue::new(),
            output: OutputQueue::new(config.preroll_frame_count, config.preroll_timeout),
            error_occurred: AtomicBool::new(false),
            eos_written: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            frame_width: AtomicU32::new(0),
            frame_height: AtomicU32::new(0),
            worker_thread: Mutex::new(None),
        });

        let bridge = PresentationBridge::new(render_context);
        // Retiring a presenting target opens decode capacity; wake the
        // worker if it is parked on backpressure.
        let wake = shared.clone();
        bridge.set_release_listener(Box::new(move || wake.output.poke()));

        Self {
            config,
            shared,
            pool,
            bridge,
            codec: Mutex::new(Some(codec)),
            worker: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Register callbacks and start the worker thread. Callable once; the
    /// callbacks survive resets.
    pub fn initialize(&self, status: StatusCallback, error: ErrorCallback) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(DecoderError::InvalidStateTransition(
                "pipeline already initialized".into(),
            ));
        }
        let Some(codec) = self.codec.lock().take() else {
            return Err(DecoderError::InvalidStateTransition(
                "pipeline already initialized".into(),
            ));
        };

        let callbacks = Arc::new(Callbacks { status, error });
        let shared = self.shared.clone();
        let outstanding = self.bridge.outstanding_handle();
        let max_cached = self.config.max_cached_frames;
        let spawned = thread::Builder::new()
            .name("video-decoder".into())
            .spawn(move || {
                info!("decoder thread started");
                worker_loop(shared, codec, callbacks, outstanding, max_cached);
                info!("decoder thread stopped");
            });
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                Err(DecoderError::CodecInitializationFailure(format!(
                    "failed to spawn decoder thread: {e}"
                )))
            }
        }
    }

    /// Enqueue encoded access units in submission order.
    ///
    /// The first write after initialize (or after a reset) starts decoding.
    /// Rejected while resetting or after end of stream; silently ignored
    /// after an unrecovered decoder error.
    pub fn write_input_buffers(&self, inputs: Vec<InputBuffer>) -> Result<()> {
        if inputs.is_empty() {
            return Ok(());
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(DecoderError::InvalidStateTransition(
                "pipeline not initialized".into(),
            ));
        }
        if self.shared.eos_written.load(Ordering::SeqCst) {
            return Err(DecoderError::InvalidStateTransition(
                "input rejected after end of stream".into(),
            ));
        }
        {
            // The error flag is read under the state lock so a write racing
            // a decoder error cannot restart decoding.
            let mut state = self.shared.state.lock();
            if self.shared.error_occurred.load(Ordering::SeqCst) {
                debug!("ignoring {} input buffers after decoder error", inputs.len());
                return Ok(());
            }
            match *state {
                PipelineState::Stopped => {
                    info!("starting decode");
                    *state = PipelineState::DecodingFrames;
                }
                PipelineState::DecodingFrames => {}
                PipelineState::ResettingDecoder => {
                    return Err(DecoderError::InvalidStateTransition(
                        "input rejected while resetting".into(),
                    ));
                }
                PipelineState::EndingStream => {
                    return Err(DecoderError::InvalidStateTransition(
                        "input rejected after end of stream".into(),
                    ));
                }
            }
        }
        self.shared.state_changed.notify_all();
        self.shared.input.push_all(inputs);
        Ok(())
    }

    /// Signal that no further input will arrive. Queued input is decoded,
    /// then the codec drains; `PipelineEvent::EndOfStream` fires once the
    /// last image reaches the output queue. Idempotent while already
    /// ending.
    pub fn write_end_of_stream(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(DecoderError::InvalidStateTransition(
                "pipeline not initialized".into(),
            ));
        }
        {
            let mut state = self.shared.state.lock();
            if self.shared.error_occurred.load(Ordering::SeqCst) {
                debug!("ignoring end of stream after decoder error");
                return Ok(());
            }
            if self.shared.eos_written.swap(true, Ordering::SeqCst) {
                debug!("end of stream already written");
                return Ok(());
            }
            match *state {
                PipelineState::ResettingDecoder => {
                    self.shared.eos_written.store(false, Ordering::SeqCst);
                    return Err(DecoderError::InvalidStateTransition(
                        "end of stream rejected while resetting".into(),
                    ));
                }
                PipelineState::Stopped | PipelineState::DecodingFrames => {
                    *state = PipelineState::EndingStream;
                }
                PipelineState::EndingStream => {}
            }
        }
        self.shared.state_changed.notify_all();
        self.shared.input.wake_all();
        Ok(())
    }

    /// Cancel everything and return to `Stopped`. Safe to call from any
    /// thread and any state; pending and written input is discarded, the
    /// output queue is cleared (returning its buffer leases to the pool)
    /// and the call blocks until codec teardown completes on the worker.
    pub fn reset(&self) {
        debug_assert_ne!(
            Some(thread::current().id()),
            *self.shared.worker_thread.lock(),
            "reset must not be called from the decoder thread"
        );

        if !self.initialized.load(Ordering::SeqCst) {
            self.shared.input.clear();
            self.shared.written.clear();
            self.shared.output.clear();
            self.shared.error_occurred.store(false, Ordering::SeqCst);
            self.shared.eos_written.store(false, Ordering::SeqCst);
            return;
        }

        info!("resetting pipeline");
        self.shared.set_state(PipelineState::ResettingDecoder);
        // Flush caller-visible queues now; dropping queued images releases
        // their buffers, which also unblocks a pool acquire the codec may
        // be parked in.
        self.shared.input.clear();
        self.shared.output.clear();
        self.shared.output.poke();

        let mut state = self.shared.state.lock();
        while *state != PipelineState::Stopped {
            self.shared.state_changed.wait(&mut state);
        }
        drop(state);

        self.shared.error_occurred.store(false, Ordering::SeqCst);
        self.shared.eos_written.store(false, Ordering::SeqCst);
        info!("pipeline reset complete");
    }

    /// Non-blocking: the next presentable picture, or `None` while the
    /// output queue is empty or still prerolling.
    pub fn get_current_decode_target(&self) -> Option<PresentingTarget> {
        let image = self.shared.output.poll_ready()?;
        trace!("presenting image at pts {}", image.timestamp_us());
        Some(self.bridge.present(image))
    }

    pub fn preroll_frame_count(&self) -> usize {
        self.config.preroll_frame_count
    }

    pub fn preroll_timeout(&self) -> Duration {
        self.config.preroll_timeout
    }

    pub fn max_cached_frames(&self) -> usize {
        self.config.max_cached_frames
    }

    pub fn is_hdr_video(&self) -> bool {
        self.config.is_hdr_video
    }

    /// Dimensions of the most recently decoded picture, zero before the
    /// first one.
    pub fn frame_width(&self) -> u32 {
        self.shared.frame_width.load(Ordering::Relaxed)
    }

    pub fn frame_height(&self) -> u32 {
        self.shared.frame_height.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn error_occurred(&self) -> bool {
        self.shared.error_occurred.load(Ordering::SeqCst)
    }

    pub fn queued_output_frames(&self) -> usize {
        self.shared.output.len()
    }

    pub fn pool(&self) -> &Arc<FrameBufferPool> {
        &self.pool
    }

    pub fn bridge(&self) -> &PresentationBridge {
        &self.bridge
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.input.wake_all();
        self.shared.output.clear();
        self.shared.output.poke();
        self.shared.state_changed.notify_all();
        // Shutting the pool down fails any acquire the codec is parked in,
        // so the worker can observe the shutdown flag and exit.
        self.pool.clear_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.shared.output.clear();
    }
}

enum Step {
    Decode(InputBuffer),
    Drain,
    Teardown,
    Exit,
}

fn worker_loop(
    shared: Arc<Shared>,
    mut codec: Box<dyn CodecAdapter>,
    callbacks: Arc<Callbacks>,
    outstanding: Arc<AtomicUsize>,
    max_cached: usize,
) {
    *shared.worker_thread.lock() = Some(thread::current().id());
    let mut codec_ready = false;

    loop {
        match next_step(&shared) {
            Step::Exit => break,
            Step::Teardown => {
                codec.reset();
                codec_ready = false;
                let flushed = shared.written.clear();
                if flushed > 0 {
                    debug!("discarded {flushed} written inputs on reset");
                }
                shared.input.clear();
                shared.output.clear();
                shared.set_state(PipelineState::Stopped);
            }
            Step::Decode(input) => {
                if ensure_codec(&shared, codec.as_mut(), &mut codec_ready, &callbacks) {
                    decode_one(&shared, codec.as_mut(), &callbacks, &outstanding, max_cached, input);
                }
            }
            Step::Drain => {
                if !codec_ready {
                    // Nothing was ever decoded; the drain is trivially done.
                    finish_drain(&shared, &callbacks, Vec::new());
                } else {
                    match codec.drain() {
                        Ok(images) => finish_drain(&shared, &callbacks, images),
                        Err(e) => report_error(&shared, &callbacks, e),
                    }
                }
            }
        }
    }
}

fn next_step(shared: &Shared) -> Step {
    loop {
        if shared.shutting_down() {
            return Step::Exit;
        }
        match shared.state() {
            PipelineState::ResettingDecoder => return Step::Teardown,
            PipelineState::EndingStream => {
                // Everything already queued decodes before the codec drains.
                if let Some(input) = shared.input.try_pop() {
                    return Step::Decode(input);
                }
                return Step::Drain;
            }
            PipelineState::Stopped | PipelineState::DecodingFrames => {
                let popped = shared.input.wait_pop_while(|| {
                    !shared.shutting_down()
                        && matches!(
                            shared.state(),
                            PipelineState::Stopped | PipelineState::DecodingFrames
                        )
                });
                if let Some(input) = popped {
                    return Step::Decode(input);
                }
                // Woken by a state change or shutdown; re-evaluate.
            }
        }
    }
}

fn ensure_codec(
    shared: &Shared,
    codec: &mut dyn CodecAdapter,
    codec_ready: &mut bool,
    callbacks: &Callbacks,
) -> bool {
    if *codec_ready {
        return true;
    }
    match codec.initialize() {
        Ok(()) => {
            debug!("codec initialized");
            *codec_ready = true;
            true
        }
        Err(e) => {
            report_error(
                shared,
                callbacks,
                DecoderError::CodecInitializationFailure(e.to_string()),
            );
            false
        }
    }
}

fn decode_one(
    shared: &Shared,
    codec: &mut dyn CodecAdapter,
    callbacks: &Callbacks,
    outstanding: &AtomicUsize,
    max_cached: usize,
    input: InputBuffer,
) {
    // Backpressure: images held across the output queue and outstanding
    // presenting targets stay under the cache cap. A reset or shutdown
    // aborts the wait, flushing this unit.
    let proceed = shared.output.wait_until(
        |depth| depth + outstanding.load(Ordering::SeqCst) < max_cached,
        || {
            !shared.shutting_down()
                && matches!(
                    shared.state(),
                    PipelineState::DecodingFrames | PipelineState::EndingStream
                )
        },
    );
    if !proceed {
        return;
    }

    let timestamp = input.timestamp_us();
    shared.written.record(input.clone());
    match codec.decode(input) {
        Ok(images) => {
            shared.written.confirm(timestamp);
            for image in images {
                shared.frame_width.store(image.width(), Ordering::Relaxed);
                shared.frame_height.store(image.height(), Ordering::Relaxed);
                let depth = shared.output.push(image);
                trace!("decoded pts {timestamp}, output depth {depth}");
                (callbacks.status)(PipelineEvent::FrameReady);
            }
            (callbacks.status)(PipelineEvent::NeedsMoreInput);
        }
        Err(e) => report_error(shared, callbacks, e),
    }
}

fn finish_drain(shared: &Shared, callbacks: &Callbacks, images: Vec<Arc<crate::image::DecodedImage>>) {
    let count = images.len();
    for image in images {
        shared.frame_width.store(image.width(), Ordering::Relaxed);
        shared.frame_height.store(image.height(), Ordering::Relaxed);
        shared.output.push(image);
        (callbacks.status)(PipelineEvent::FrameReady);
    }
    if count > 0 {
        debug!("drained {count} tail frames from codec");
    }
    shared.output.mark_eos();
    info!("end of stream drain complete");
    (callbacks.status)(PipelineEvent::EndOfStream);
    // A reset that raced the drain wins; teardown runs next iteration.
    shared.try_transition(PipelineState::EndingStream, PipelineState::Stopped);
}

fn report_error(shared: &Shared, callbacks: &Callbacks, error: DecoderError) {
    warn!("decoder error: {error}");
    let first = {
        let mut state = shared.state.lock();
        let first = !shared.error_occurred.swap(true, Ordering::SeqCst);
        if *state != PipelineState::ResettingDecoder {
            *state = PipelineState::Stopped;
        }
        first
    };
    shared.state_changed.notify_all();
    if first {
        (callbacks.error)(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{GpuBufferFactory, PlaneTexture};
    use crate::image::PixelFormat;
    use std::any::Any;

    struct NullPlane;
    impl PlaneTexture for NullPlane {
        fn width(&self) -> u16 {
            0
        }
        fn height(&self) -> u16 {
            0
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct NullFactory;
    impl GpuBufferFactory for NullFactory {
        fn create_plane(
            &self,
            _width: u16,
            _height: u16,
            _format: PixelFormat,
        ) -> Result<Box<dyn PlaneTexture>> {
            Ok(Box::new(NullPlane))
        }
    }

    struct NullCodec;
    impl CodecAdapter for NullCodec {
        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }
        fn decode(&mut self, _input: InputBuffer) -> Result<Vec<Arc<crate::image::DecodedImage>>> {
            Ok(Vec::new())
        }
        fn drain(&mut self) -> Result<Vec<Arc<crate::image::DecodedImage>>> {
            Ok(Vec::new())
        }
        fn reset(&mut self) {}
    }

    fn pipeline() -> DecodePipeline {
        let pool = Arc::new(FrameBufferPool::new(
            Arc::new(NullFactory),
            PixelFormat::Yuv420,
            4,
        ));
        DecodePipeline::new(
            PipelineConfig::default(),
            Box::new(NullCodec),
            pool,
            Arc::new(RenderContextQueue::new()),
        )
    }

    #[test]
    fn test_write_before_initialize_is_rejected() {
        let p = pipeline();
        let result = p.write_input_buffers(vec![InputBuffer::new(vec![0u8], 0)]);
        assert!(matches!(
            result,
            Err(DecoderError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn test_initialize_is_callable_once() {
        let p = pipeline();
        p.initialize(Box::new(|_| {}), Box::new(|_| {})).unwrap();
        assert!(p.initialize(Box::new(|_| {}), Box::new(|_| {})).is_err());
    }

    #[test]
    fn test_reset_before_initialize_is_a_no_op() {
        let p = pipeline();
        p.reset();
        assert_eq!(p.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_config_queries() {
        let p = pipeline();
        assert_eq!(p.preroll_frame_count(), 4);
        assert_eq!(p.max_cached_frames(), 12);
        assert!(!p.is_hdr_video());
        assert_eq!(p.preroll_timeout(), Duration::from_millis(500));
    }
}
