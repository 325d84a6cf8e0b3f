//! Structured logging (A2): a `tracing-subscriber` `fmt` layer gated by
//! `-debug`, initialised once by the binary. Library code only emits
//! `tracing` events; it never prints directly.

use tracing_subscriber::EnvFilter;

pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
