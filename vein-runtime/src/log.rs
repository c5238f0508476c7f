//! Logging Infrastructure
//!
//! The runtime logs through `tracing`. This module installs a `fmt`
//! subscriber configured from [`LogConfig`]. `RUST_LOG` takes precedence
//! over the configured level when set.
//!
//! Engines log at these levels:
//!
//! | Level | Events |
//! |-------|--------|
//! | `error` | allocation exhaustion before abort |
//! | `warn` | invalid handle use, refused arena destruction |
//! | `debug` | SCC freeze/release, arena lifecycle, scope exit |
//! | `trace` | individual frees and deferred batches |

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber.
///
/// Returns `true` if this call installed it. Later calls, or a subscriber
/// installed by the host program, leave the existing one in place.
pub fn init_logging(config: &LogConfig) -> bool {
    if config.level == LogLevel::Off || INSTALLED.swap(true, Ordering::AcqRel) {
        return false;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vein_runtime={}", config.level.as_str())));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_writer(std::io::stderr);

    let installed = if config.timestamps {
        builder.try_init().is_ok()
    } else {
        builder.without_time().try_init().is_ok()
    };

    if installed {
        tracing::debug!(level = config.level.as_str(), "runtime logging initialized");
    }
    installed
}

/// Whether [`init_logging`] has already run.
pub fn is_initialized() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_off_level_installs_nothing() {
        let config = LogConfig {
            level: LogLevel::Off,
            ..LogConfig::default()
        };
        assert!(!init_logging(&config));
    }

    #[test]
    fn test_second_init_is_noop() {
        let config = LogConfig::default();
        init_logging(&config);
        assert!(is_initialized());
        assert!(!init_logging(&config));
    }
}
