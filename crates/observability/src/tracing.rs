//! Tracing subscriber initialization.

use courier_core::{LogFormat, LogSettings};
use tracing_subscriber::EnvFilter;

/// Build the level filter: `RUST_LOG` wins, then the configured level, then `info`.
pub fn env_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(settings: &LogSettings) {
    let filter = env_filter(settings);

    let _ = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(true)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        let settings = LogSettings {
            level: "debug".to_string(),
            format: LogFormat::Text,
        };

        init(&settings);
        init(&settings);
        ::tracing::info!("still logging after double init");
    }

    #[test]
    fn invalid_level_falls_back() {
        let settings = LogSettings {
            level: "not a [valid directive".to_string(),
            format: LogFormat::Json,
        };

        // Must not panic whatever RUST_LOG holds.
        let _ = env_filter(&settings);
    }
}
