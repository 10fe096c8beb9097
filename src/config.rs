use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub termination: TerminationConfig,
    pub budget: BudgetConfig,
    pub bus: BusConfig,
    pub groups: GroupConfig,
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Thresholds for the per-iteration termination checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminationConfig {
    /// Average velocity (percent per iteration) below which progress is "low".
    pub low_velocity_threshold: f64,
    /// Stall confidence at or above which a stall is Critical.
    pub stall_critical_confidence: f64,
    /// Budget usage ratio that triggers a warning.
    pub budget_warning_ratio: f64,
    /// Budget usage ratio that counts as exceeded.
    pub budget_exceeded_ratio: f64,
    /// Consecutive stalled evaluations before a persistent-stall termination.
    pub persistent_stall_count: u32,
    /// How many recent error counts are kept per task.
    pub error_history_len: usize,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    /// Lowercase phrases that mean the agent hit an unrecoverable failure.
    pub catastrophic_patterns: Vec<String>,
    /// Where terminating decisions are written, if anywhere.
    pub report_dir: Option<PathBuf>,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            low_velocity_threshold: 5.0,
            stall_critical_confidence: 0.8,
            budget_warning_ratio: 0.8,
            budget_exceeded_ratio: 1.5,
            persistent_stall_count: 3,
            error_history_len: 5,
            input_cost_per_1k: 0.003,
            output_cost_per_1k: 0.015,
            catastrophic_patterns: vec![
                "out of memory".to_string(),
                "stack overflow".to_string(),
                "maximum call stack".to_string(),
                "fatal error".to_string(),
                "unrecoverable error".to_string(),
            ],
            report_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Flat rate used for budget accounting (dollars per 1K tokens).
    pub cost_per_1k_tokens: f64,
    pub warning_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            cost_per_1k_tokens: 0.01,
            warning_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus directory name relative to the project root.
    pub dir_name: String,
    pub poll_interval_ms: u64,
    pub read_attempts: u32,
    pub read_retry_delay_ms: u64,
    pub scratchpad_messages: usize,
    /// Disable to force poll-only delivery.
    pub use_watcher: bool,
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dir_name: ".agent-bus".to_string(),
            poll_interval_ms: 5000,
            read_attempts: 3,
            read_retry_delay_ms: 100,
            scratchpad_messages: 50,
            use_watcher: true,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub report_dir: Option<PathBuf>,
    pub event_capacity: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            report_dir: None,
            event_capacity: 64,
        }
    }
}

/// Durable writer settings. Hosts own the writer's lifetime and pass
/// `flush_timeout()` to `DurableWriter::flush` or `flush_all` at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub flush_timeout_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { flush_timeout_ms: 5000 }
    }
}

impl WriterConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
