//! Application-wide error types.
//!
//! Tool-level failures are translated into one of these variants inside the
//! extraction pipeline; raw exit codes and signals never cross the scheduler
//! or API boundary uninterpreted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an external tool ran under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// The extractor resolving and fetching the source media.
    Extracting,
    /// The transcoder normalizing container/codec.
    Transcoding,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Extracting => write!(f, "extraction"),
            Stage::Transcoding => write!(f, "transcode"),
        }
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server is at capacity, try again later")]
    Overloaded,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{stage} stage exceeded its {timeout_secs}s timeout")]
    ToolTimeout { stage: Stage, timeout_secs: u64 },

    #[error("{stage} tool exited with code {exit_code}: {detail}")]
    ToolFailed {
        stage: Stage,
        exit_code: i32,
        detail: String,
    },

    #[error("extractor reported success but produced no output file")]
    NoOutputProduced,

    #[error("job was cancelled")]
    Cancelled,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error while {op} ({path}): {source}")]
    Io {
        op: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// IO error with operation + path context.
    pub fn io_path(op: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }

    /// Short machine-readable kind, used in API error bodies and job
    /// status snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Overloaded => "OVERLOADED",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::ToolTimeout { .. } => "TOOL_TIMEOUT",
            Error::ToolFailed { .. } => "TOOL_FAILED",
            Error::NoOutputProduced => "NO_OUTPUT_PRODUCED",
            Error::Cancelled => "CANCELLED",
            Error::JobNotFound(_) => "NOT_FOUND",
            Error::Serialization(_) | Error::Io { .. } | Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The stage a tool-level failure occurred in, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::ToolTimeout { stage, .. } | Error::ToolFailed { stage, .. } => Some(*stage),
            Error::NoOutputProduced => Some(Stage::Extracting),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::Overloaded.kind(), "OVERLOADED");
        assert_eq!(
            Error::ToolFailed {
                stage: Stage::Extracting,
                exit_code: 1,
                detail: "boom".into()
            }
            .kind(),
            "TOOL_FAILED"
        );
        assert_eq!(Error::internal("x").kind(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Extracting.to_string(), "extraction");
        assert_eq!(Stage::Transcoding.to_string(), "transcode");
    }

    #[test]
    fn test_no_output_is_extraction_stage() {
        assert_eq!(Error::NoOutputProduced.stage(), Some(Stage::Extracting));
        assert_eq!(Error::Overloaded.stage(), None);
    }
}
