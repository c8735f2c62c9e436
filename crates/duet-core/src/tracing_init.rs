//! Shared tracing/logging initialization.
//!
//! The relay and the `duet` client binary install the same subscriber: an
//! env-filter plus either human-readable or JSON output. Logs always go to
//! stderr so the client's stdout stays reserved for chat output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"duet_relay=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Returns `false` if a global subscriber was already installed (tests that
/// spin up several relays in one process hit this).
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_owned());
    let env_filter = tracing_subscriber::EnvFilter::new(filter);

    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let installed = if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt)
            .try_init()
    };
    installed.is_ok()
}
