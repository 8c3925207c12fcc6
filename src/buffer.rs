//! The opaque unit of media data moving between ports.

use std::sync::Arc;

/// A reference-counted, opaque buffer. Cloning is a refcount bump, not a
/// copy, so it is safe to clone on the real-time data path.
#[derive(Clone, Debug)]
pub struct Buffer {
    sequence: u64,
    payload: Arc<[u8]>,
}

impl Buffer {
    pub fn new(sequence: u64, payload: impl Into<Arc<[u8]>>) -> Self {
        Self { sequence, payload: payload.into() }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
