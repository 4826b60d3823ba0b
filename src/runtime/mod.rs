//! Single-threaded runtime for the echo server.
//!
//! Built on mio (epoll on Linux, kqueue on macOS):
//! - `Server`: owns the poller, listener, flush timer and connections
//! - `ConnectionState`: per-connection ring buffer and in-flight write
//! - `FlushTimer`: periodic deadline that paces writes out of the rings

mod connection;
mod event_loop;
mod timer;

pub use event_loop::Server;

use crate::config::Config;

/// Bind and run the server on the current thread until it is stopped.
pub fn run(config: Config) -> std::io::Result<()> {
    let server = Server::bind(config)?;
    server.run()
}
