use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

fn build_env_filter_from(arkload_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    if let Some(v) = arkload_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var("ARKLOAD_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the global subscriber once. `json` selects NDJSON lines with
/// RFC3339 UTC timestamps; otherwise a compact human format. Both go to stderr.
pub fn init_logging(json: bool) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = build_env_filter();
        let timer = tracing_subscriber::fmt::time::UtcTime::rfc_3339();

        if json {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(timer)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init();
        }
    });
}
