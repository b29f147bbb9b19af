//! Input Buffers
//!
//! Encoded access units queued for submission to the codec. Payloads are
//! `Bytes`, so moving a unit between the pending and written queues is a
//! refcount bump, not a copy.

use bytes::Bytes;

/// One encoded access unit.
#[derive(Debug, Clone)]
pub struct InputBuffer {
    payload: Bytes,
    timestamp_us: i64,
    is_key_frame: bool,
}

impl InputBuffer {
    pub fn new(payload: impl Into<Bytes>, timestamp_us: i64) -> Self {
        Self {
            payload: payload.into(),
            timestamp_us,
            is_key_frame: false,
        }
    }

    pub fn key_frame(payload: impl Into<Bytes>, timestamp_us: i64) -> Self {
        Self {
            payload: payload.into(),
            timestamp_us,
            is_key_frame: true,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Presentation timestamp in microseconds.
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }
}
