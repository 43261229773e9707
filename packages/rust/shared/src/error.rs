//! Error types for CELIA.
//!
//! Library crates use [`CeliaError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all CELIA operations.
#[derive(Debug, thiserror::Error)]
pub enum CeliaError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Generator output could not be turned into a JSON object.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Generation service failure (transport, quota, or malformed response).
    #[error("generation error: {0}")]
    Generation(String),

    /// Retrieval service failure.
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad identifiers, unknown document types, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pipeline stage tried to read a slot an earlier stage never filled.
    #[error("stage '{stage}' requires '{slot}', which no earlier stage produced")]
    MissingStageOutput {
        stage: &'static str,
        slot: &'static str,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CeliaError>;

impl CeliaError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error came from an external collaborator rather than
    /// from local data handling.
    pub fn is_collaborator(&self) -> bool {
        matches!(self, Self::Generation(_) | Self::Retrieval(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CeliaError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = CeliaError::validation("unknown document type 'XYZ'");
        assert!(err.to_string().contains("XYZ"));
    }

    #[test]
    fn missing_stage_output_names_stage_and_slot() {
        let err = CeliaError::MissingStageOutput {
            stage: "generate_narrative",
            slot: "structured",
        };
        let msg = err.to_string();
        assert!(msg.contains("generate_narrative"));
        assert!(msg.contains("structured"));
    }

    #[test]
    fn collaborator_classification() {
        assert!(CeliaError::Generation("HTTP 429".into()).is_collaborator());
        assert!(CeliaError::Retrieval("timeout".into()).is_collaborator());
        assert!(!CeliaError::parse("bad json").is_collaborator());
    }
}
