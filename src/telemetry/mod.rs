//! Opt-in tracing bootstrap.
//!
//! The runtime instruments its entry points with `tracing` but never
//! installs a subscriber on its own. Applications that want the default
//! setup (env-filtered fmt output plus span-trace capture for diagnostic
//! reports) can call [`init`] once at startup; embedders with their own
//! subscriber stack should skip this and compose the layers themselves.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber.
///
/// The filter honors `RUST_LOG`, defaulting to `info` for this crate and
/// `warn` elsewhere. Calling this more than once returns an error from
/// the underlying registry; ignore it when initialization may race (e.g.
/// in tests).
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,stategraph=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(ErrorLayer::default())
        .try_init()
}
