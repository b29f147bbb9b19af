//! Codec Adapter
//!
//! Seam to the concrete hardware codec. The pipeline owns the call
//! discipline (single worker thread, drain-before-eos, reset teardown);
//! the adapter owns the hardware session.

use std::sync::Arc;

use crate::error::Result;
use crate::image::DecodedImage;
use crate::input::InputBuffer;

/// Implemented by the platform decode backend. All methods are invoked on
/// the pipeline's worker thread.
pub trait CodecAdapter: Send {
    /// Create the hardware session. Called once, lazily, before the first
    /// decode; a failure is reported as `CodecInitializationFailure`.
    fn initialize(&mut self) -> Result<()>;

    /// Submit one access unit. Returns zero or more decoded pictures in
    /// production order; hardware decoders typically buffer a few units
    /// before the first picture appears.
    fn decode(&mut self, input: InputBuffer) -> Result<Vec<Arc<DecodedImage>>>;

    /// Flush all in-flight work. Blocks until the codec signals drain
    /// completion and returns the tail pictures in production order.
    fn drain(&mut self) -> Result<Vec<Arc<DecodedImage>>>;

    /// Tear down in-flight codec state. Must leave the adapter ready for a
    /// fresh `initialize`.
    fn reset(&mut self);
}
