//! Size-bounded output buffer
//!
//! Agent tools can print a lot. The CappedBuffer keeps everything up to a
//! fixed capacity and then stops growing, remembering that it dropped data
//! so the final result can say so.

/// A fixed-capacity, append-only byte buffer
///
/// Unlike a ring buffer, the *first* `capacity` bytes are kept: the head of
/// an agent's output carries the structured events, the tail is usually noise.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    data: Vec<u8>,
    capacity: usize,
    /// Total bytes offered (may exceed capacity)
    total_written: usize,
}

impl CappedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            total_written: 0,
        }
    }

    /// Append data, returning how many bytes were actually kept.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.total_written = self.total_written.saturating_add(data.len());
        let room = self.capacity.saturating_sub(self.data.len());
        let kept = room.min(data.len());
        self.data.extend_from_slice(&data[..kept]);
        kept
    }

    /// Record `len` bytes against the budget without storing them.
    ///
    /// Used for streams that are forwarded rather than kept.
    pub fn admit(&mut self, len: usize) -> usize {
        self.total_written = self.total_written.saturating_add(len);
        let used = self.total_written - len;
        self.capacity.saturating_sub(used).min(len)
    }

    pub fn read_all(&self) -> &[u8] {
        &self.data
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_written == 0
    }

    /// Whether any offered bytes were discarded
    pub fn truncated(&self) -> bool {
        self.total_written > self.capacity
    }

    pub fn total_written(&self) -> usize {
        self.total_written
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
