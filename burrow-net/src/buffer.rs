//! The byte region behind each comm point.
//!
//! A fixed-capacity buffer with a position/limit pair: filled between
//! position and capacity, then flipped so readers see position zero up
//! to the number of bytes written. The framing code treats the content
//! as opaque; parsing belongs to the resolver.

/// Fixed-capacity byte buffer with position and limit.
pub struct SizedBuffer {
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl SizedBuffer {
    pub fn new(capacity: usize) -> SizedBuffer {
        SizedBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.limit);
        self.position = position;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        assert!(limit <= self.capacity());
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
    }

    /// Bytes between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Reset for writing: position zero, limit at capacity.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Switch from writing to reading: limit moves to the current
    /// position, position rewinds to zero.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Advance the position over `n` already-transferred bytes.
    pub fn skip(&mut self, n: usize) {
        assert!(n <= self.remaining());
        self.position += n;
    }

    /// Big-endian u16 at an absolute offset.
    pub fn read_u16_at(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.data[at], self.data[at + 1]])
    }

    /// The readable region, position up to limit.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// The writable region, position up to limit.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// The whole backing region, ignoring position and limit.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `src` in at the position and advance past it.
    pub fn write_slice(&mut self, src: &[u8]) {
        let end = self.position + src.len();
        assert!(end <= self.limit, "buffer overflow");
        self.data[self.position..end].copy_from_slice(src);
        self.position = end;
    }
}
