use std::time::Duration;

/// Failures raised by the storage adapters.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("backend unreachable: {0}")]
    Connection(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("parameter mismatch: {0}")]
    ParamMismatch(String),
    #[error("insert failed: {0}")]
    Insert(String),
}

/// Everything the query path can report to a caller.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("parse error at {line}:{column}: {message}")]
    Parse {
        message: String,
        line: usize,
        column: usize,
    },
    #[error("validation error in stage {stage_index}: {message}")]
    Validation { message: String, stage_index: usize },
    /// Internal planner invariant broke. Indicates a bug, not bad user input.
    #[error("plan error: {0}")]
    Plan(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("query exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("extraction error: {0}")]
    Extraction(String),
}

impl QueryError {
    pub fn parse(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::Parse {
            message: message.into(),
            line,
            column,
        }
    }

    pub fn validation(message: impl Into<String>, stage_index: usize) -> Self {
        Self::Validation {
            message: message.into(),
            stage_index,
        }
    }

    /// Error kind tag used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::Validation { .. } => "validation_error",
            Self::Plan(_) => "plan_error",
            Self::Storage(_) => "storage_error",
            Self::DeadlineExceeded(_) => "timeout",
            Self::Extraction(_) => "extraction_error",
        }
    }
}
