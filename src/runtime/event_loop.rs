//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on the thread that calls [`Server::run`]: accepts,
//! reads, timer ticks and write completions are handled one after another
//! between calls to `Poll::poll`. The poll timeout doubles as the flush
//! timer.

use super::connection::{ConnectionRegistry, ConnectionState, PushOutcome, WriteProgress};
use super::timer::FlushTimer;
use crate::config::{Config, EchoMode};
use crate::ring::{Chunk, RingBuffer};
use bytes::BytesMut;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// How many chunks a flush pass may write per connection.
#[derive(Debug, Clone, Copy)]
enum FlushBudget {
    One,
    All,
}

/// Server context: owns the poller, listener, flush timer and every
/// connection. Handlers receive it as `&mut self`.
pub struct Server {
    config: Config,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry<TcpStream>,
    timer: FlushTimer,
    read_buf: BytesMut,
    shutdown: bool,
}

impl Server {
    /// Bind the listener and register it with a fresh poller.
    pub fn bind(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(
            addr = %local_addr,
            mode = ?config.mode,
            capacity = config.capacity,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Server listening"
        );

        Ok(Server {
            connections: ConnectionRegistry::new(config.max_connections),
            timer: FlushTimer::new(config.flush_interval, Instant::now()),
            read_buf: BytesMut::with_capacity(config.max_chunk_len),
            config,
            poll,
            listener,
            local_addr,
            shutdown: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until a client sends the shutdown sentinel.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.shutdown {
            let timeout = match self.config.mode {
                EchoMode::Buffered => Some(self.timer.timeout(Instant::now())),
                EchoMode::Immediate => None,
            };

            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => {
                        if let Err(e) = self.handle_connection_event(conn_id, event) {
                            warn!(conn_id, error = %e, "Connection error");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }

            if self.config.mode == EchoMode::Buffered && self.timer.fire_if_due(Instant::now()) {
                self.on_flush_tick();
            }
        }

        self.drain_on_shutdown();
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.shutdown {
                        debug!(peer = %peer, "Shutting down, dropping new connection");
                        continue;
                    }
                    if self.connections.is_full() {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let ring = match RingBuffer::new(self.config.capacity) {
                        Ok(ring) => ring,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Failed to allocate ring buffer");
                            continue;
                        }
                    };

                    let Some(conn_id) = self
                        .connections
                        .insert(ConnectionState::new(stream, peer, ring))
                    else {
                        continue;
                    };

                    let Some(conn) = self.connections.get_mut(conn_id) else {
                        continue;
                    };
                    if let Err(e) = self.poll.registry().register(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) -> io::Result<()> {
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if event.is_readable() || event.is_read_closed() {
            self.handle_readable(conn_id)?;
        }

        // Re-check connection exists (may have been removed)
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if event.is_writable() {
            self.handle_writable(conn_id)?;
        }

        Ok(())
    }

    /// Ingress: turn every available read into a chunk and buffer it.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        loop {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return Ok(());
            };
            if conn.is_closing() {
                return Ok(());
            }

            self.read_buf.clear();
            self.read_buf.resize(self.config.max_chunk_len, 0);

            let n = match conn.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    trace!(conn_id, "Connection closed by peer");
                    return self.begin_teardown(conn_id);
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            // Only the bytes actually read become the chunk
            self.read_buf.truncate(n);
            let chunk = Chunk::new(self.read_buf.split().freeze());

            let ingress = conn.ingest(chunk, self.config.sentinel, self.config.overflow);
            match ingress.outcome {
                PushOutcome::Buffered => {
                    trace!(
                        conn_id,
                        len = n,
                        buffered = conn.buffered(),
                        buffered_bytes = conn.buffered_bytes(),
                        "Buffered chunk"
                    );
                }
                PushOutcome::Rejected(chunk) => {
                    debug!(conn_id, len = chunk.len(), "Ring buffer full, dropping newest chunk");
                }
                PushOutcome::Evicted(chunk) => {
                    debug!(conn_id, len = chunk.len(), "Ring buffer full, evicted oldest chunk");
                }
            }

            if ingress.shutdown {
                info!(conn_id, peer = %conn.peer, "Shutdown sentinel received");
                self.shutdown = true;
            }

            if self.config.mode == EchoMode::Immediate {
                self.flush_connection(conn_id, FlushBudget::All)?;
            }
        }
    }

    /// Write completion: continue the in-flight chunk.
    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        let progress = conn.write_pending()?;
        if progress == WriteProgress::Blocked {
            return Ok(());
        }

        if conn.is_closing() {
            self.close_connection(conn_id);
            return Ok(());
        }

        match self.config.mode {
            EchoMode::Immediate => self.flush_connection(conn_id, FlushBudget::All).map(|_| ()),
            EchoMode::Buffered => self.update_interest(conn_id),
        }
    }

    /// Flush timer: each idle connection writes its oldest chunk.
    fn on_flush_tick(&mut self) {
        let mut flushed = 0;

        for conn_id in self.connections.ids() {
            match self.flush_connection(conn_id, FlushBudget::One) {
                Ok(WriteProgress::Idle) => {}
                Ok(_) => flushed += 1,
                Err(e) => {
                    warn!(conn_id, error = %e, "Write error, dropping chunk");
                    self.close_connection(conn_id);
                }
            }
        }

        trace!(flushed, "Flush tick");
    }

    fn flush_connection(
        &mut self,
        conn_id: usize,
        budget: FlushBudget,
    ) -> io::Result<WriteProgress> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(WriteProgress::Idle);
        };

        let progress = match budget {
            FlushBudget::One => conn.flush_one()?,
            FlushBudget::All => conn.flush_all()?,
        };
        if progress != WriteProgress::Idle {
            trace!(conn_id, ?progress, buffered = conn.buffered(), "Flushed");
        }

        self.update_interest(conn_id)?;
        Ok(progress)
    }

    /// EOF: discard buffered chunks and close, unless a write is still in
    /// flight, in which case the close waits for it.
    fn begin_teardown(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        let dropped = conn.begin_close();
        if dropped > 0 {
            debug!(conn_id, dropped, "Discarded buffered chunks");
        }

        if conn.has_pending_write() {
            self.update_interest(conn_id)
        } else {
            self.close_connection(conn_id);
            Ok(())
        }
    }

    fn update_interest(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        if let Some(interest) = conn.interest_change() {
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(conn_id), interest)?;
        }
        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(conn_id, peer = %conn.peer, "Connection closed");
        }
    }

    /// Best-effort final flush of every connection, then close them all.
    fn drain_on_shutdown(&mut self) {
        info!(connections = self.connections.len(), "Shutting down");

        for conn_id in self.connections.ids() {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                match conn.flush_all() {
                    Ok(WriteProgress::Blocked) => {
                        let dropped = conn.begin_close();
                        warn!(conn_id, dropped, "Socket not writable, dropping buffered chunks");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(conn_id, error = %e, "Write error during shutdown"),
                }
            }
            self.close_connection(conn_id);
        }
    }
}

/// Create a non-blocking TCP listener with the configured backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn test_config(mode: EchoMode, capacity: usize, flush_ms: u64) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            mode,
            capacity,
            flush_interval: Duration::from_millis(flush_ms),
            ..Config::default()
        }
    }

    fn spawn_server(config: Config) -> (SocketAddr, JoinHandle<io::Result<()>>) {
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr();
        (addr, thread::spawn(move || server.run()))
    }

    fn connect(addr: SocketAddr) -> StdTcpStream {
        let stream = StdTcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn read_exact_vec(stream: &mut StdTcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Stop the server from a separate connection and wait for it.
    fn stop(addr: SocketAddr, handle: JoinHandle<io::Result<()>>) {
        let mut control = connect(addr);
        control.write_all(b"z").unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_immediate_echo_and_sentinel_shutdown() {
        let (addr, handle) = spawn_server(test_config(EchoMode::Immediate, 4, 60_000));
        let mut client = connect(addr);

        client.write_all(b"ping").unwrap();
        assert_eq!(read_exact_vec(&mut client, 4), b"ping");

        // The sentinel payload is echoed before the server stops
        client.write_all(b"zzz").unwrap();
        assert_eq!(read_exact_vec(&mut client, 3), b"zzz");

        handle.join().unwrap().unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_buffered_echo_after_flush_tick() {
        let (addr, handle) = spawn_server(test_config(EchoMode::Buffered, 4, 50));
        let mut client = connect(addr);

        client.write_all(b"hello").unwrap();
        assert_eq!(read_exact_vec(&mut client, 5), b"hello");

        thread::sleep(Duration::from_millis(20));
        client.write_all(b"world").unwrap();
        assert_eq!(read_exact_vec(&mut client, 5), b"world");

        stop(addr, handle);
    }

    #[test]
    fn test_buffered_holds_data_until_shutdown_drain() {
        let (addr, handle) = spawn_server(test_config(EchoMode::Buffered, 4, 60_000));
        let mut client = connect(addr);

        client.write_all(b"held").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 4];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));

        stop(addr, handle);

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"held");
    }

    #[test]
    fn test_full_ring_rejects_newest_chunks() {
        let mut config = test_config(EchoMode::Buffered, 2, 60_000);
        config.overflow = OverflowPolicy::RejectNewest;
        let (addr, handle) = spawn_server(config);
        let mut client = connect(addr);

        for payload in [b"a", b"b", b"c", b"d"] {
            client.write_all(payload).unwrap();
            thread::sleep(Duration::from_millis(50));
        }

        stop(addr, handle);

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"ab");
    }

    #[test]
    fn test_peer_close_discards_buffered_chunks() {
        let (addr, handle) = spawn_server(test_config(EchoMode::Buffered, 4, 60_000));

        let mut client = connect(addr);
        client.write_all(b"never echoed").unwrap();
        drop(client);
        thread::sleep(Duration::from_millis(50));

        // Server keeps serving other connections
        stop(addr, handle);
    }

    #[test]
    fn test_bind_failure_reported() {
        let first = Server::bind(test_config(EchoMode::Buffered, 1, 1000)).unwrap();
        let mut config = test_config(EchoMode::Buffered, 1, 1000);
        config.listen = first.local_addr();

        assert!(Server::bind(config).is_err());
    }
}
