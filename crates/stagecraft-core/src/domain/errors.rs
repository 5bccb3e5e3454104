//! Errors - stage errors and their classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ErrorKind は stage エラーの運用分類
///
/// - Transient: 一時的なエラー（max_attempts までリトライ）
/// - Quota: リソース枯渇（リトライせず、同一 project の同じ stage を止める）
/// - Permanent: 恒久的なエラー（リトライ無意味）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Quota,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Quota => "quota",
            ErrorKind::Permanent => "permanent",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "quota" => Ok(ErrorKind::Quota),
            "permanent" => Ok(ErrorKind::Permanent),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// Error returned by a stage executor.
///
/// Stages classify their own failures; the scheduler only acts on the class.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("{message}")]
    Transient {
        message: String,
        stack: Option<String>,
    },

    /// Resource quota exhausted upstream. Retrying cannot succeed.
    #[error("quota exhausted: {message}")]
    Quota {
        message: String,
        stack: Option<String>,
    },

    #[error("{message}")]
    Permanent {
        message: String,
        stack: Option<String>,
    },

    /// The stage observed its cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient {
            message: message.into(),
            stack: None,
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        StageError::Quota {
            message: message.into(),
            stack: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StageError::Permanent {
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace or diagnostic dump.
    pub fn with_stack(self, trace: impl Into<String>) -> Self {
        let trace = Some(trace.into());
        match self {
            StageError::Transient { message, .. } => StageError::Transient {
                message,
                stack: trace,
            },
            StageError::Quota { message, .. } => StageError::Quota {
                message,
                stack: trace,
            },
            StageError::Permanent { message, .. } => StageError::Permanent {
                message,
                stack: trace,
            },
            StageError::Cancelled => StageError::Cancelled,
        }
    }

    /// `None` for cancellation, which is not an error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StageError::Transient { .. } => Some(ErrorKind::Transient),
            StageError::Quota { .. } => Some(ErrorKind::Quota),
            StageError::Permanent { .. } => Some(ErrorKind::Permanent),
            StageError::Cancelled => None,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            StageError::Transient { stack, .. }
            | StageError::Quota { stack, .. }
            | StageError::Permanent { stack, .. } => stack.as_deref(),
            StageError::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(StageError::transient("x").kind(), Some(ErrorKind::Transient));
        assert_eq!(StageError::quota("x").kind(), Some(ErrorKind::Quota));
        assert_eq!(StageError::permanent("x").kind(), Some(ErrorKind::Permanent));
        assert_eq!(StageError::Cancelled.kind(), None);
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Quota.is_retryable());
    }

    #[test]
    fn with_stack_keeps_class_and_message() {
        let err = StageError::quota("credits exhausted").with_stack("provider said 429");
        assert_eq!(err.kind(), Some(ErrorKind::Quota));
        assert_eq!(err.stack(), Some("provider said 429"));
        assert_eq!(err.to_string(), "quota exhausted: credits exhausted");
    }
}
