//! mb - in-memory message broker
//!
//! This is the convenience crate that re-exports the broker sub-crates.
//! Use this crate if you just want to assemble and run a broker; reach for
//! `mb-core` or `mb-server` directly if you only need the wire types or
//! want to embed the broker assembly in a larger service.
//!
//! # Architecture
//!
//! `mb` is organized into two crates:
//!
//! - **mb-core**: transport-agnostic wire types, topic trie, codec
//! - **mb-server**: broker assembly — connections, registry, router,
//!   subscription manager, monitoring
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mb::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default().apply_env_overrides();
//!     let broker = Broker::builder(config).build().await?;
//!     tokio::signal::ctrl_c().await?;
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub use mb_core as core;
pub use mb_server as server;

pub use mb_server::{Broker, BrokerConfig, PortsConfig, SslConfig};

/// Install a `tracing` subscriber reading its filter from `RUST_LOG`
/// (defaulting to `info`), matching the logging setup every binary built
/// on this crate is expected to perform once at startup.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Build a broker from `config`, run until `Ctrl-C` (or an OS TERM signal
/// on Unix), then shut it down cleanly. The bootstrap this wraps —
/// reading a config file, managing a process supervisor — is left to the
/// embedding application; this only covers the run loop.
pub async fn run(config: BrokerConfig) -> mb_core::Result<()> {
    let broker = Broker::builder(config).build().await?;
    tracing::info!("broker started");

    wait_for_shutdown_signal().await;

    tracing::info!("broker shutting down");
    broker.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
