//! Structured logging for the skein server.
//!
//! Console output through the `tracing` ecosystem, filterable via
//! `RUST_LOG`, with an optional JSON file layer for post-mortem analysis
//! of handshake and transport issues.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// `filter` overrides the default directives; `RUST_LOG` overrides both.
/// When `log_dir` is given, a JSON copy of everything goes to
/// `skein-server.log` in that directory.
pub fn init_logging(log_dir: Option<&Path>, filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.map(EnvFilter::new).unwrap_or_else(default_env_filter));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join("skein-server.log"))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Default directives: `info` everywhere, with the chatty per-frame
/// transport internals kept at `debug`.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info,skein_net::connection=debug")
}
