//! Pipeline Errors
//!
//! Error taxonomy for the decode pipeline. Codec and resource failures are
//! reported once through the registered error callback and latched in a
//! sticky flag; recovery requires an explicit reset and re-initialize.

/// Errors surfaced by the decode pipeline and frame-buffer pool.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum DecoderError {
    /// The codec adapter failed to initialize.
    #[error("codec initialization failed: {0}")]
    CodecInitializationFailure(String),

    /// A single access unit failed to decode. The pipeline halts until reset.
    #[error("decode failed: {0}")]
    DecodeFailure(String),

    /// The frame-buffer pool cannot satisfy the request within its
    /// configured bound, or has been shut down.
    #[error("frame buffer pool exhausted: {0}")]
    ResourceExhaustion(String),

    /// An operation was attempted in a state that does not permit it.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),
}

pub type Result<T, E = DecoderError> = std::result::Result<T, E>;
