//! ring-echo: a TCP echo server paced by a bounded ring buffer
//!
//! Every connection gets a fixed-capacity ring of byte chunks. Reads push
//! chunks in; a periodic flush timer pops the oldest chunk and writes it
//! back. A full ring rejects new data instead of growing.
//!
//! Features:
//! - Buffered (timer-paced) or immediate echo
//! - Reject-newest or evict-oldest overflow policy
//! - A payload starting with the sentinel byte (`z`) stops the server
//! - Configuration via CLI arguments or TOML file

mod config;
mod ring;
mod runtime;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        mode = ?config.mode,
        capacity = config.capacity,
        flush_interval_ms = config.flush_interval.as_millis() as u64,
        max_chunk_len = config.max_chunk_len,
        overflow = ?config.overflow,
        sentinel = %(config.sentinel as char),
        "Starting ring-echo server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}
