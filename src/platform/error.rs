//! Crate-wide error type.

use crate::CancelReason;

#[derive(Debug, thiserror::Error)]
pub enum HbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("trace error: {0}")]
    Trace(String),

    #[error("rewrite error: {0}")]
    Rewrite(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("analysis cancelled ({0})")]
    Cancelled(CancelReason),
}

pub type HbResult<T> = Result<T, HbError>;

impl HbError {
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }
}
