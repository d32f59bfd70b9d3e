//! Logging initialization for the CLI.
//!
//! Library code only emits `tracing` events; the binary decides where they go.

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a stderr subscriber.
///
/// Without `-v` the filter comes from `RUST_LOG`, or `warn` when it is unset.
/// `-v` raises this crate to DEBUG and `-vv` to TRACE on top of it.
pub fn init(verbosity: u8) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(filter(verbosity, env.as_deref()))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn filter(verbosity: u8, env: Option<&str>) -> EnvFilter {
    let mut filter = env
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    if let Some(directive) = crate_directive(verbosity) {
        filter = filter.add_directive(directive);
    }
    filter
}

fn crate_directive(verbosity: u8) -> Option<Directive> {
    let level = match verbosity {
        0 => return None,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    format!("xpdep={level}").parse().ok()
}
