//! Error types for the segment recorder.

use thiserror::Error;

/// Result type alias for recorder operations.
pub type Result<T> = std::result::Result<T, RecorderError>;

/// Errors returned by recorder and entity operations.
///
/// None of these are fatal. Callers on the task path log them and move on.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// An operation needed an open segment in the current execution context.
    #[error("cannot {0}: no segment is open in this context")]
    ContextMissing(&'static str),

    /// `end_subsegment` was called with only the segment open.
    #[error("no subsegment is open in this context")]
    NoOpenSubsegment,

    /// Recording is switched off in the configuration.
    #[error("recording is disabled")]
    Disabled,

    /// Annotation keys are limited to ASCII alphanumerics and underscores.
    #[error("invalid annotation key '{0}'")]
    InvalidAnnotationKey(String),

    /// Metadata namespaces prefixed with `AWS.` belong to the backend.
    #[error("metadata namespace '{0}' is reserved")]
    ReservedNamespace(String),

    /// A metadata value could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error type for handing closed segments to an emitter.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RecorderError::ContextMissing("end_segment");
        assert_eq!(
            err.to_string(),
            "cannot end_segment: no segment is open in this context"
        );

        let err = RecorderError::InvalidAnnotationKey("bad key".to_string());
        assert_eq!(err.to_string(), "invalid annotation key 'bad key'");
    }
}
