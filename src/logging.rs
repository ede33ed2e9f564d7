//! Development-time diagnostics, separate from the build's console output.
//!
//! Node results and failure detail go straight to stdout (that's the
//! product); the spam/debug channel here goes to stderr and is filtered by
//! `RUST_LOG`, defaulting to warnings only.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
