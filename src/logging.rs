use std::str::FromStr;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber. A bare level (e.g. "debug") gets quiet
/// defaults for transport crates; full directive strings are used as given.
pub fn setup_logging(log_level: &str, json_format: bool) {
    let normalized = log_level.trim();
    let filter_spec = if normalized.contains(',') || normalized.contains('=') {
        normalized.to_string()
    } else {
        format!("{normalized},hyper=info,reqwest=info,tokio_tungstenite=info,tungstenite=info,ethers_providers=info")
    };
    let filter = EnvFilter::from_str(&filter_spec).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = if json_format {
        subscriber.with(fmt::layer().json().with_target(false).with_current_span(false)).try_init()
    } else {
        subscriber.with(fmt::layer().with_target(true).compact()).try_init()
    };

    if installed.is_ok() {
        let format = if json_format { "json" } else { "compact" };
        tracing::info!(filter = %filter_spec, format, "logging initialized");
    }
}
