//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its stream, its ring buffer, and at most one
//! in-flight write. The stream type is generic so the state machine can be
//! driven without sockets.

use crate::config::OverflowPolicy;
use crate::ring::{Chunk, Full, RingBuffer};
use mio::Interest;
use slab::Slab;
use std::io::{self, Write};
use std::net::SocketAddr;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Reading from the peer; ingress pushes and the timer pops.
    Reading,
    /// Peer is gone. The ring has been emptied; only an already started
    /// write may still finish before the connection is removed.
    Closing,
}

/// Result of handing one read's worth of bytes to a connection.
#[derive(Debug)]
pub enum PushOutcome {
    Buffered,
    /// Ring was full; the new chunk was dropped.
    Rejected(Chunk),
    /// Ring was full; the oldest chunk was dropped to make room.
    Evicted(Chunk),
}

#[derive(Debug)]
pub struct Ingress {
    pub outcome: PushOutcome,
    /// The chunk started with the control sentinel.
    pub shutdown: bool,
}

/// Progress of the in-flight write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Nothing to write.
    Idle,
    /// The chunk was fully written and released.
    Complete,
    /// The socket would block; the rest stays in flight.
    Blocked,
}

/// A chunk taken out of the ring and partly written.
#[derive(Debug)]
struct PendingWrite {
    chunk: Chunk,
    written: usize,
}

/// A single client connection.
#[derive(Debug)]
pub struct ConnectionState<S> {
    pub stream: S,
    pub peer: SocketAddr,
    ring: RingBuffer,
    phase: ConnPhase,
    pending: Option<PendingWrite>,
    /// Interest currently registered with the poller.
    registered: Interest,
}

impl<S: Write> ConnectionState<S> {
    /// Create a new connection in the reading phase.
    pub fn new(stream: S, peer: SocketAddr, ring: RingBuffer) -> Self {
        Self {
            stream,
            peer,
            ring,
            phase: ConnPhase::Reading,
            pending: None,
            registered: Interest::READABLE,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.phase == ConnPhase::Closing
    }

    pub fn has_pending_write(&self) -> bool {
        self.pending.is_some()
    }

    /// Chunks waiting in the ring, not counting the in-flight write.
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.ring.buffered_bytes()
    }

    /// Buffer one read's worth of bytes.
    pub fn ingest(&mut self, chunk: Chunk, sentinel: u8, policy: OverflowPolicy) -> Ingress {
        let shutdown = chunk.first_byte() == Some(sentinel);

        if self.is_closing() {
            return Ingress {
                outcome: PushOutcome::Rejected(chunk),
                shutdown,
            };
        }

        let outcome = match policy {
            OverflowPolicy::RejectNewest => match self.ring.push(chunk) {
                Ok(()) => PushOutcome::Buffered,
                Err(Full(chunk)) => PushOutcome::Rejected(chunk),
            },
            OverflowPolicy::EvictOldest => match self.ring.push_evicting(chunk) {
                None => PushOutcome::Buffered,
                Some(evicted) => PushOutcome::Evicted(evicted),
            },
        };

        Ingress { outcome, shutdown }
    }

    /// Enter the closing phase, discarding everything still in the ring.
    ///
    /// Returns the number of chunks discarded.
    pub fn begin_close(&mut self) -> usize {
        self.phase = ConnPhase::Closing;
        self.ring.clear()
    }

    /// Pop the oldest chunk into the write slot.
    ///
    /// Returns false if a write is already in flight, the ring is empty,
    /// or the connection is closing.
    fn start_write(&mut self) -> bool {
        if self.is_closing() || self.pending.is_some() {
            return false;
        }
        match self.ring.pop() {
            Ok(chunk) => {
                self.pending = Some(PendingWrite { chunk, written: 0 });
                true
            }
            Err(_) => false,
        }
    }

    /// Continue the in-flight write.
    ///
    /// On error the chunk is dropped, never retried.
    pub fn write_pending(&mut self) -> io::Result<WriteProgress> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(WriteProgress::Idle);
        };

        while pending.written < pending.chunk.len() {
            match self.stream.write(&pending.chunk.as_bytes()[pending.written..]) {
                Ok(0) => {
                    self.pending = None;
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => pending.written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Blocked);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.pending = None;
                    return Err(e);
                }
            }
        }

        self.pending = None;
        Ok(WriteProgress::Complete)
    }

    /// Timer tick: write at most one chunk from the ring.
    ///
    /// A connection that still has a write in flight is left alone.
    pub fn flush_one(&mut self) -> io::Result<WriteProgress> {
        if !self.start_write() {
            return Ok(WriteProgress::Idle);
        }
        self.write_pending()
    }

    /// Finish the in-flight write, then keep popping until the ring is
    /// empty or the socket would block.
    pub fn flush_all(&mut self) -> io::Result<WriteProgress> {
        let mut progress = WriteProgress::Idle;
        loop {
            match self.write_pending()? {
                WriteProgress::Blocked => return Ok(WriteProgress::Blocked),
                WriteProgress::Complete => progress = WriteProgress::Complete,
                WriteProgress::Idle => {}
            }
            if !self.start_write() {
                return Ok(progress);
            }
        }
    }

    /// Interest this connection should be registered with.
    pub fn desired_interest(&self) -> Interest {
        match (self.phase, self.pending.is_some()) {
            (ConnPhase::Reading, false) => Interest::READABLE,
            (ConnPhase::Reading, true) => Interest::READABLE | Interest::WRITABLE,
            (ConnPhase::Closing, _) => Interest::WRITABLE,
        }
    }

    /// Returns the new interest if it differs from the registered one,
    /// recording it as registered.
    pub fn interest_change(&mut self) -> Option<Interest> {
        let desired = self.desired_interest();
        if desired == self.registered {
            None
        } else {
            self.registered = desired;
            Some(desired)
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S> {
    connections: Slab<ConnectionState<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: ConnectionState<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut ConnectionState<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<ConnectionState<S>> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Snapshot of live connection ids, for passes that may remove entries.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}
