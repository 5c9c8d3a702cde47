//! Recorder configuration.

use serde::{Deserialize, Serialize};

/// Default depth of recorded stack traces.
pub const DEFAULT_MAX_TRACE_BACK: usize = 10;

/// How operations that need an open segment report a missing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMissing {
    /// Log a warning and continue.
    #[default]
    LogError,
    /// Continue silently (debug log only).
    Ignore,
}

/// Local sampling rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Traces recorded unconditionally per second before `fixed_rate` applies.
    pub reservoir_per_second: u32,
    /// Fraction of the remaining traces recorded.
    pub fixed_rate: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            reservoir_per_second: 1,
            fixed_rate: 0.05,
        }
    }
}

impl SamplingConfig {
    /// Record every trace.
    pub fn always() -> Self {
        Self {
            reservoir_per_second: 0,
            fixed_rate: 1.0,
        }
    }

    /// Record nothing unless upstream already decided to.
    pub fn never() -> Self {
        Self {
            reservoir_per_second: 0,
            fixed_rate: 0.0,
        }
    }
}

/// Configuration for the recorder.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Segment name used when a caller passes an empty one.
    pub service_name: String,
    /// Whether anything is recorded at all.
    pub enabled: bool,
    /// Maximum frames kept per recorded stack trace.
    pub max_trace_back: usize,
    /// Reporting policy for operations with no open segment.
    pub context_missing: ContextMissing,
    /// Local sampling rule.
    pub sampling: SamplingConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            service_name: "taskray".to_string(),
            enabled: true,
            max_trace_back: DEFAULT_MAX_TRACE_BACK,
            context_missing: ContextMissing::LogError,
            sampling: SamplingConfig::default(),
        }
    }
}

impl RecorderConfig {
    /// Config that samples every trace (tests, demos).
    pub fn sample_all() -> Self {
        Self {
            sampling: SamplingConfig::always(),
            ..Self::default()
        }
    }

    /// Config that records nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecorderConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_trace_back, 10);
        assert_eq!(config.context_missing, ContextMissing::LogError);
        assert_eq!(config.sampling.reservoir_per_second, 1);
    }

    #[test]
    fn test_context_missing_names() {
        let parsed: ContextMissing = serde_json::from_str("\"ignore\"").unwrap();
        assert_eq!(parsed, ContextMissing::Ignore);
        let parsed: ContextMissing = serde_json::from_str("\"log_error\"").unwrap();
        assert_eq!(parsed, ContextMissing::LogError);
    }
}
