//! Structured logging for the buffer manager and the tools built on it.
//!
//! The library crates log through the `log` facade; this crate installs a
//! `tracing` subscriber that receives those records (via the `tracing-log`
//! bridge) together with native `tracing` events from binaries.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use winsys_config::Config;

/// Filter used when neither `RUST_LOG` nor the config says otherwise.
pub const DEFAULT_FILTER: &str = "info";

/// File written into the log directory in debug builds.
pub const LOG_FILE_NAME: &str = "winsys.log";

/// Initialize the global tracing subscriber.
///
/// Sets up:
/// - Console output with uptime, target and severity
/// - JSON file logging in debug builds (optional)
/// - Environment-based filtering (respects RUST_LOG)
/// - The config's `debug.log_level` as the fallback filter
///
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
///
/// # Examples
///
/// ```no_run
/// use winsys_log::init_logging;
/// use winsys_config::Config;
///
/// init_logging(None, false, None);
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_for(config);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true) // contexts run on named threads
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}

/// Filter string derived from the optional config.
pub fn filter_for(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.is_empty() => config.debug.log_level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter = default_env_filter();
        assert!(format!("{}", filter).contains("info"));
    }

    #[test]
    fn test_filter_from_config() {
        let mut config = Config::default();
        config.debug.log_level = "warn,winsys_bufmgr=debug".to_string();
        assert_eq!(filter_for(Some(&config)), "warn,winsys_bufmgr=debug");
    }

    #[test]
    fn test_empty_config_level_falls_back() {
        let mut config = Config::default();
        config.debug.log_level.clear();
        assert_eq!(filter_for(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_for(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_subsystem_filters_parse() {
        let valid_filters = [
            "info",
            "debug,winsys_bufmgr=trace",
            "warn,winsys_fence=debug,winsys_batch=trace",
            "error",
        ];

        for filter_str in &valid_filters {
            let result = EnvFilter::try_new(*filter_str);
            assert!(result.is_ok(), "Failed to parse filter: {}", filter_str);
        }
    }

    #[test]
    fn test_file_logging_creates_log_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs");

        init_logging(Some(&log_dir), true, None);

        // Another test may have installed the global subscriber first, but the
        // directory and file are created before installation is attempted.
        assert!(log_dir.join(LOG_FILE_NAME).exists());
    }
}
