//! Logging bootstrap for host applications.
//!
//! Every module logs through the `log` facade. Nothing is emitted until the
//! host calls [`setup_logging`] once at startup; before that, log calls are
//! cheap no-ops.

use std::fs;
use std::path::PathBuf;

use eyre::{Context, Result};
use log::{info, warn};

use crate::config::LoggingConfig;

/// Resolve the directory log files are written to.
pub fn log_dir(config: &LoggingConfig) -> PathBuf {
    config.log_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("herdr")
            .join("logs")
    })
}

/// Initialize env_logger writing to `<log_dir>/herdr.log`.
///
/// `RUST_LOG` overrides the configured level. A second call leaves the first
/// logger in place and only reports it.
pub fn setup_logging(config: &LoggingConfig) -> Result<PathBuf> {
    let log_dir = log_dir(config);
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("herdr.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let env = env_logger::Env::default().default_filter_or(config.level.as_str());
    if let Err(e) = env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .try_init()
    {
        warn!("Logger already initialized: {}", e);
        return Ok(log_file);
    }

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(log_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_dir_prefers_configured_path() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            log_dir: Some(PathBuf::from("/var/log/herdr")),
        };
        assert_eq!(log_dir(&config), PathBuf::from("/var/log/herdr"));
    }

    #[test]
    fn test_setup_logging_creates_file_and_tolerates_second_call() {
        let temp = TempDir::new().unwrap();
        let config = LoggingConfig {
            level: "info".to_string(),
            log_dir: Some(temp.path().join("logs")),
        };

        let first = setup_logging(&config).unwrap();
        assert!(first.exists());

        let second = setup_logging(&config).unwrap();
        assert_eq!(first, second);
    }
}
