//! File logging for short-lived ctl invocations.
//!
//! Restart requests and watchdog runs come from timers with no terminal, so
//! logs go to a daily file under the state directory. Stderr is used when the
//! directory cannot be created.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use hero_watch_core::state_dir;

const DEBUG_LOG_ENV: &str = "HERO_WATCH_DEBUG_LOG";
const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "hero-watch-ctl.log";

fn filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Keep the guard alive until exit so buffered lines flush.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = state_dir().ok().map(|dir| dir.join(LOG_DIR_NAME));
    let Some(log_dir) = log_dir.filter(|dir| fs_err::create_dir_all(dir).is_ok()) else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .try_init();
        return None;
    };

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Some(guard)
}
