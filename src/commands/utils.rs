use chrono::Duration;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use crate::config::{AgentConfig, AgentPaths};
use crate::platform::common::ensure_private_directory;

/// Initialize logging to the terminal and, when possible, to `log_file`
pub fn init_logging(verbose: bool, level: &str, log_file: Option<&Path>) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose { "debug" } else { level };

    let file_layer = log_file.and_then(|path| match open_log_file(path) {
        Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
        Err(e) => {
            eprintln!("Warning: file logging disabled: {:#}", e);
            None
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Initialize logging with the level from `config.json` (if readable)
pub fn init_agent_logging(paths: &AgentPaths, verbose: bool) {
    let level = AgentConfig::load(&paths.config_file())
        .ok()
        .flatten()
        .map(|config| config.log_level)
        .unwrap_or_else(|| "info".to_string());

    init_logging(verbose, &level, Some(&paths.log_file()));
}

fn open_log_file(path: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        ensure_private_directory(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(file)
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
