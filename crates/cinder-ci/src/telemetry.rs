//! Tracing setup for the cinder binary.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber used by `cinder`.
///
/// Logs are written to stderr because `cinder run` and `cinder runs show
/// --json` print their results on stdout, and those must stay parseable when
/// piped. `RUST_LOG` wins over `level`. With `json` each log line is a JSON
/// object carrying the structured stage fields (`stage`, `run_id`,
/// `exit_code`). A subscriber installed earlier is left in place.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(layer.json()).try_init().ok();
    } else {
        registry.with(layer).try_init().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
        tracing::info!(stage = "checkout", "subscriber installed");
    }
}
