//! Growable per-column conversion buffer.

use tracing::trace;

/// Minimum allocation for a column buffer.
pub const MIN_CAPACITY: usize = 256;

/// Owned byte buffer used to materialize string and blob columns.
///
/// Capacity only ever grows: a value larger than the current capacity grows
/// the buffer before copying, and the grown allocation is kept for the next
/// rows of the same result set.
#[derive(Debug, Default)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    capacity: usize,
    len: usize,
}

impl GrowableBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buffer = Self::new();
        buffer.ensure_capacity(capacity);
        buffer
    }

    /// Grows the buffer so it can hold at least `needed` bytes.
    ///
    /// Returns `true` if the buffer had to grow.
    pub fn ensure_capacity(&mut self, needed: usize) -> bool {
        if needed <= self.capacity {
            return false;
        }
        let new_capacity = needed.max(self.capacity * 2).max(MIN_CAPACITY);
        trace!(from = self.capacity, to = new_capacity, "growing column buffer");
        self.data.resize(new_capacity, 0);
        self.capacity = new_capacity;
        true
    }

    /// Replaces the contents with `bytes`, growing first if needed.
    pub fn store(&mut self, bytes: &[u8]) -> &[u8] {
        self.ensure_capacity(bytes.len());
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        self.as_bytes()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Length of the value currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes allocated for this column.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forgets the current value but keeps the allocation.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}
