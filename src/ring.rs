//! Fixed-capacity ring of owned byte chunks.
//!
//! The ring sits between the read side and the write side of a connection:
//! ingress pushes one chunk per read, the flush timer pops the oldest chunk
//! and writes it out. Chunks are moved in and out of their slots, never
//! copied.
//!
//! ## Layout
//!
//! ```text
//! capacity = 5, count = 3, head = 1
//!
//!   slot:   0     1     2     3     4
//!         [ b ] [ c ] [   ] [   ] [ a ]
//!                 ^head             ^tail = (head + capacity + 1 - count) % capacity
//! ```
//!
//! Occupied slots always form one contiguous run (modulo `capacity`) ending
//! at `head`. Pushing advances `head`; popping takes from the tail.

use bytes::Bytes;

/// One owned, immutable unit of buffered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    data: Bytes,
}

impl Chunk {
    /// Wrap bytes as a chunk without copying them.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// First payload byte, used for control sentinel detection.
    pub fn first_byte(&self) -> Option<u8> {
        self.data.first().copied()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Bytes> for Chunk {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl From<&'static [u8]> for Chunk {
    fn from(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
        }
    }
}

/// Ring buffer errors that leave the caller holding nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring buffer capacity must be at least 1")]
    InvalidCapacity,
    #[error("ring buffer is empty")]
    Empty,
}

/// A push was rejected because every slot is occupied.
///
/// The rejected chunk is handed back so the caller keeps ownership.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("ring buffer is full, rejected {} byte chunk", .0.len())]
pub struct Full(pub Chunk);

/// Fixed-capacity FIFO of chunks.
///
/// Not synchronized: every method takes `&mut self` and the ring is owned
/// by exactly one connection on the event loop thread.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Box<[Option<Chunk>]>,
    /// Slot of the most recently pushed chunk.
    head: usize,
    count: usize,
}

impl RingBuffer {
    /// Allocate `capacity` empty slots.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::InvalidCapacity);
        }

        let slots: Vec<Option<Chunk>> = (0..capacity).map(|_| None).collect();

        Ok(Self {
            slots: slots.into_boxed_slice(),
            // First push lands in slot 0
            head: capacity - 1,
            count: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Total payload bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.slots.iter().flatten().map(Chunk::len).sum()
    }

    /// Move `chunk` into the slot after `head`.
    ///
    /// Returns the chunk inside [`Full`] when no slot is free; the ring is
    /// left untouched in that case.
    pub fn push(&mut self, chunk: Chunk) -> Result<(), Full> {
        if self.is_full() {
            return Err(Full(chunk));
        }
        self.insert(chunk);
        Ok(())
    }

    /// Push, evicting the oldest chunk if the ring is full.
    ///
    /// Returns the evicted chunk, if any.
    pub fn push_evicting(&mut self, chunk: Chunk) -> Option<Chunk> {
        let evicted = if self.is_full() { self.pop().ok() } else { None };
        self.insert(chunk);
        evicted
    }

    /// Take the oldest buffered chunk.
    pub fn pop(&mut self) -> Result<Chunk, RingError> {
        if self.count == 0 {
            return Err(RingError::Empty);
        }

        let tail = self.tail();
        let chunk = self.slots[tail].take().ok_or(RingError::Empty)?;
        self.count -= 1;
        Ok(chunk)
    }

    /// Drop every buffered chunk and return to the freshly built state.
    ///
    /// Returns how many chunks were discarded. Calling it on an empty ring
    /// does nothing.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        while self.pop().is_ok() {
            dropped += 1;
        }
        self.head = self.capacity() - 1;
        dropped
    }

    fn insert(&mut self, chunk: Chunk) {
        debug_assert!(self.count < self.capacity());
        self.head = (self.head + 1) % self.capacity();
        debug_assert!(self.slots[self.head].is_none(), "slot past head must be free");
        self.slots[self.head] = Some(chunk);
        self.count += 1;
    }

    /// Slot of the oldest chunk. Only meaningful when `count > 0`.
    fn tail(&self) -> usize {
        (self.head + self.capacity() + 1 - self.count) % self.capacity()
    }
}
