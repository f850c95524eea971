//! # Logging
//!
//! Global `tracing` subscriber setup. `RUST_LOG` wins over the configured
//! level.

use crate::settings::LogSettings;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber once; later calls are no-ops
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(settings: &LogSettings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        let settings = LogSettings {
            level: "not a directive [".to_string(),
            json: false,
        };
        init_tracing(&settings);
        assert!(!init_tracing(&LogSettings::default()));
    }
}
