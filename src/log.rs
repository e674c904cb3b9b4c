//! Structured logging for hive.
//!
//! Log levels:
//! - ERROR: Failures that abort a run (state I/O, invariant violations)
//! - WARN: Degraded paths the scheduler survives (heartbeat write failed, stall detected)
//! - INFO: Lifecycle transitions (level started, merged, worker spawned)
//! - DEBUG: Every state transaction and claim decision
//! - TRACE: Poll loop iterations
//!
//! The filter comes from `HIVE_LOG` when set. Otherwise debug mode
//! (`init_with_debug(true)` or `HIVE_DEBUG=1`) selects `debug`, else `info`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::HiveConfig;

const LOG_ENV: &str = "HIVE_LOG";
const DEBUG_ENV: &str = "HIVE_DEBUG";

/// Initialize logging to ~/.hive/hive.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Falls back to stderr when the home directory is unavailable. Safe to
/// call more than once; later calls leave the first subscriber in place.
pub fn init_with_debug(debug: bool) {
    init_with(debug, log_path().as_deref());
}

/// Initialize logging, writing to `log_path` when given or stderr otherwise.
pub fn init_with(debug: bool, log_path: Option<&Path>) {
    let debug_enabled = debug || env_debug();

    let env = std::env::var(LOG_ENV).ok();
    let filter = EnvFilter::try_new(filter_directive(debug_enabled, env.as_deref()))
        .unwrap_or_else(|_| EnvFilter::new(default_level(debug_enabled)));

    let file = log_path.and_then(open_log_file);
    let builder = fmt().with_env_filter(filter).with_target(true);
    let _ = match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Filter directive for the given debug flag and `HIVE_LOG` value.
pub fn filter_directive(debug: bool, env: Option<&str>) -> String {
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directive) => directive.to_string(),
        None => default_level(debug).to_string(),
    }
}

fn default_level(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Truncate on startup.
fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    File::create(path).ok()
}

/// Default log file location.
pub fn log_path() -> Option<PathBuf> {
    HiveConfig::hive_dir().ok().map(|dir| dir.join("hive.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_defaults() {
        assert_eq!(filter_directive(false, None), "info");
        assert_eq!(filter_directive(true, None), "debug");
    }

    #[test]
    fn test_filter_directive_env_wins() {
        assert_eq!(
            filter_directive(false, Some("hive::state=trace,warn")),
            "hive::state=trace,warn"
        );
        assert_eq!(filter_directive(true, Some("  ")), "debug");
    }

    #[test]
    fn test_open_log_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hive.log");
        assert!(open_log_file(&path).is_some());
        assert!(path.exists());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.log");
        init_with(true, Some(&path));
        init_with(false, Some(&path));
        tracing::info!("still logging");
    }
}
