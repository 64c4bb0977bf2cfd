//! Bounded scratch buffer shared by requests and responses.

use crate::error::EnrollError;

/// Default capacity, sized for a 2048-bit CSR or a signed certificate chain.
pub const DEFAULT_CAPACITY: usize = 4096;

/// A single reusable buffer holding the current outbound request body or the
/// inbound response body.
///
/// Writes that would exceed the capacity fail with
/// [`EnrollError::BufferExhausted`] and leave the contents unchanged.
#[derive(Debug, Clone)]
pub struct ScratchBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl ScratchBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Replace the contents.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), EnrollError> {
        if bytes.len() > self.capacity {
            return Err(EnrollError::BufferExhausted {
                capacity: self.capacity,
            });
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append a streamed chunk.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<(), EnrollError> {
        if self.data.len() + chunk.len() > self.capacity {
            return Err(EnrollError::BufferExhausted {
                capacity: self.capacity,
            });
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
