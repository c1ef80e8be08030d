use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::Mutex,
};

use anyhow::{anyhow, Context, Result};
use mimic_core::{rotate_log_file_if_oversized, LogRotationPolicy};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber: a plain-text file log, plus the console in debug mode.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(log_file: &Path, debug_mode: bool, policy: LogRotationPolicy) -> Result<()> {
    let file = open_log_file(log_file, policy)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false);
    let console_layer = debug_mode.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|error| anyhow!("failed to install log subscriber: {error}"))
}

/// Rotates an oversized log, then opens it for appending.
fn open_log_file(path: &Path, policy: LogRotationPolicy) -> Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    rotate_log_file_if_oversized(path, policy)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}
