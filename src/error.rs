use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid case id: {0}")]
    InvalidCaseId(String),

    #[error("invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error("invalid checkpoint id: {0}")]
    InvalidCheckpointId(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value for {key}: {message}")]
    ConfigValue { key: &'static str, message: String },

    #[error("GDC request failed: {message}")]
    Http { message: String, transient: bool },

    #[error("GDC returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("GDC rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("unexpected GDC response: {0}")]
    Response(String),

    #[error("download of {file_id} timed out after {secs}s")]
    Timeout { file_id: String, secs: u64 },

    #[error("no eligible count file for case {0}")]
    NoFileForCase(String),

    #[error("count table {0} has no '{1}' column")]
    MissingColumn(String, String),

    #[error("count table {0} is missing its header preamble")]
    MissingHeader(String),

    #[error("count table {0} has no usable gene counts")]
    EmptyCounts(String),

    #[error("vector dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector for case {0} is empty")]
    EmptyVector(String),

    #[error("case {0} is already indexed")]
    DuplicateCase(String),

    #[error("case {0} is not in the index")]
    CaseNotIndexed(String),

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("checkpoint {id} is unusable: {message}")]
    Checkpoint { id: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl KiraError {
    pub fn is_transient(&self) -> bool {
        match self {
            KiraError::Http { transient, .. } => *transient,
            KiraError::Timeout { .. } | KiraError::RateLimited(_) => true,
            KiraError::Status { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let transient = err.is_timeout() || err.is_connect() || err.is_request();
        KiraError::Http {
            message: err.to_string(),
            transient,
        }
    }

    pub(crate) fn filesystem(err: impl std::fmt::Display) -> Self {
        KiraError::Filesystem(err.to_string())
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
