//! Logging setup.
//!
//! Formatting policy is out of scope for this crate (spec §1); this module
//! only wires `tracing` up to stdout with an `RUST_LOG`-driven filter, the
//! way the teacher's `logging::setup_stdout` does for its non-file case.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info";

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false))
        .with(filter)
        .init();
}
