//! Configuration file support for taskray.
//!
//! All taskray data is stored in a `.taskray/` directory:
//! - `.taskray/config.toml` - Configuration file
//! - `.taskray/traces/` - Segment files (daily rotation)
//! - `.taskray/sessions/` - Per-run simulation output
//! - `.taskray/logs/` - Log files
//!
//! Config discovery searches for `.taskray/config.toml` starting from the current
//! directory and walking up to parent directories.

use std::path::{Path, PathBuf};

/// The taskray data directory name.
pub const TASKRAY_DIR: &str = ".taskray";
/// The config file name within the taskray directory.
pub const CONFIG_FILE: &str = "config.toml";

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use taskray_recorder::{RecorderConfig, Rotation, WriterConfig};

/// Upper bound on `[worker] count`; each worker holds a blocking thread.
pub const MAX_WORKERS: usize = 256;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Recorder settings, including `[recorder.sampling]`.
    pub recorder: RecorderConfig,
    /// Segment persistence settings.
    pub writer: WriterConfig,
    /// Simulated worker pool settings.
    pub worker: WorkerConfig,
}

/// Worker pool configuration for simulations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads, each standing in for a worker process.
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { count: 2 }
    }
}

/// Contents written by `taskray init`.
pub const DEFAULT_CONFIG: &str = r#"# taskray configuration
# All paths are relative to this .taskray/ directory unless absolute

[recorder]
service_name = "taskray"
enabled = true
max_trace_back = 10
context_missing = "log_error"  # Options: "log_error", "ignore"

[recorder.sampling]
reservoir_per_second = 1  # Traces always recorded each second
fixed_rate = 0.05         # Fraction recorded beyond the reservoir

[writer]
trace_path = "traces"  # Stored in .taskray/traces/
enabled = true
rotation = "daily"     # Options: "daily" (one file per day), "session" (trace_path is one file)

[worker]
count = 2
"#;

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration from current or parent directories.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Looks for `.taskray/config.toml` in the directory and its parents and
    /// returns the config with the `.taskray` directory it was found in.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let taskray_dir = dir.join(TASKRAY_DIR);
            let config_path = taskray_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, taskray_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Writer config with a relative trace path resolved against the
    /// `.taskray` directory.
    pub fn resolved_writer(&self, taskray_dir: Option<&Path>) -> WriterConfig {
        let mut writer = self.writer.clone();
        if writer.trace_path.is_relative() {
            let base = taskray_dir.map_or_else(|| PathBuf::from(TASKRAY_DIR), Path::to_path_buf);
            // The default already carries the directory prefix
            let relative = writer
                .trace_path
                .strip_prefix(TASKRAY_DIR)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| writer.trace_path.clone());
            writer.trace_path = base.join(relative);
        }
        writer
    }

    /// The configured writer to run next to a simulation's own output file,
    /// or `None` when it is disabled or would append to that same file.
    pub fn extra_writer(&self, taskray_dir: Option<&Path>, output: &Path) -> Option<WriterConfig> {
        let writer = self.resolved_writer(taskray_dir);
        if !writer.enabled {
            return None;
        }
        let same_file = writer.rotation == Rotation::Session
            && absolute_or_raw(&writer.trace_path) == absolute_or_raw(output);
        (!same_file).then_some(writer)
    }

    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if self.recorder.service_name.trim().is_empty() {
            errors.push(ConfigValidationError {
                field: "recorder.service_name".to_string(),
                message: "Service name cannot be empty.".to_string(),
            });
        }

        if self.recorder.max_trace_back == 0 {
            errors.push(ConfigValidationError {
                field: "recorder.max_trace_back".to_string(),
                message: "Must keep at least one stack frame.".to_string(),
            });
        }

        let rate = self.recorder.sampling.fixed_rate;
        if !(0.0..=1.0).contains(&rate) {
            errors.push(ConfigValidationError {
                field: "recorder.sampling.fixed_rate".to_string(),
                message: format!("Fixed rate {rate} is outside 0.0..=1.0."),
            });
        }

        if self.writer.enabled && self.writer.trace_path.as_os_str().is_empty() {
            errors.push(ConfigValidationError {
                field: "writer.trace_path".to_string(),
                message: "Trace path required when the writer is enabled.".to_string(),
            });
        }

        if self.worker.count == 0 {
            errors.push(ConfigValidationError {
                field: "worker.count".to_string(),
                message: "At least one worker is required.".to_string(),
            });
        } else if self.worker.count > MAX_WORKERS {
            errors.push(ConfigValidationError {
                field: "worker.count".to_string(),
                message: format!("At most {MAX_WORKERS} workers are supported."),
            });
        }

        errors
    }
}

fn absolute_or_raw(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}
