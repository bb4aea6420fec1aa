//! Tracing setup for binaries and demos embedding the engine.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global subscriber: `RUST_LOG`-driven filtering, compact
/// formatting, and span traces attached to errors.
///
/// Call once at process start. Library code only emits events; it never
/// installs a subscriber itself.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .with(ErrorLayer::default())
        .init();
}
