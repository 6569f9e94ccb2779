//! Error types for pipeline runs
//!
//! Errors are classified by what the run does with them:
//! - Skippable: one bad source record; counted, logged, the run continues
//! - Fatal: configuration, IO and storage errors; the run stops and exits non-zero

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum PipelineError {
    // Skippable record errors
    #[error("Line {line}: invalid JSON record: {source}")]
    RecordParse {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("Line {line}: unparseable sent_at '{value}'")]
    InvalidTimestamp { line: u64, value: String },

    #[error("Line {line}: record has no sender email")]
    MissingSender { line: u64 },

    #[error("Line {line}: not valid UTF-8: {source}")]
    InvalidEncoding {
        line: u64,
        #[source]
        source: std::str::Utf8Error,
    },

    // Fatal errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("{0} malformed source records were skipped")]
    SkippedRecords(u64),
}

impl PipelineError {
    /// Returns true if the error affects a single source record only.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            PipelineError::RecordParse { .. }
                | PipelineError::InvalidTimestamp { .. }
                | PipelineError::MissingSender { .. }
                | PipelineError::InvalidEncoding { .. }
        )
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Get a short recovery hint for the operator.
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            PipelineError::RecordParse { .. }
            | PipelineError::InvalidTimestamp { .. }
            | PipelineError::MissingSender { .. }
            | PipelineError::InvalidEncoding { .. } => "The record was skipped; fix the source line and re-ingest.",
            PipelineError::Config(_) | PipelineError::InvalidPattern { .. } => {
                "Check your configuration in ~/.pastlead/config.json"
            }
            PipelineError::Io { .. } => "Check the file path and permissions.",
            PipelineError::Db(_) => {
                "Committed batches are intact. Re-run the command to resume from the last checkpoint."
            }
            PipelineError::SkippedRecords(_) => {
                "Everything else was stored. See the warnings above for the offending lines."
            }
        }
    }
}
