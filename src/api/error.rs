use serde::Serialize;
use thiserror::Error;

use crate::services::storage::{StorageError, StorageErrorCode};
use crate::utils::validation::ValidationError;

/// Coarse classification the caller switches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    Unauthorized,
    Stalled,
    Timeout,
    Cancelled,
    RetryLimitExceeded,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Stalled => "stalled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RetryLimitExceeded => "retry_limit_exceeded",
            ErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    ValidationFailed(ValidationError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Upload stalled at {percent:.0}%")]
    Stalled { percent: f64 },

    #[error("Upload timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Upload failed after {attempts} attempts")]
    RetryLimitExceeded { attempts: u32 },

    #[error("Upload failed: {0}")]
    Unknown(String),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            UploadError::Unauthorized(_) => ErrorKind::Unauthorized,
            UploadError::Stalled { .. } => ErrorKind::Stalled,
            UploadError::Timeout { .. } => ErrorKind::Timeout,
            UploadError::Cancelled => ErrorKind::Cancelled,
            UploadError::RetryLimitExceeded { .. } => ErrorKind::RetryLimitExceeded,
            UploadError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// One actionable sentence for the person who picked the file
    pub fn guidance(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ValidationFailed => {
                "Choose a JPEG, PNG, GIF or WebP image within the size limit."
            }
            ErrorKind::Unauthorized => "Your session has expired. Sign in again and retry.",
            ErrorKind::Stalled => "The connection stopped responding. Retrying automatically.",
            ErrorKind::Timeout => {
                "The upload took too long. Check your connection or try a smaller image."
            }
            ErrorKind::Cancelled => "The upload was cancelled.",
            ErrorKind::RetryLimitExceeded => {
                "The upload kept stalling. Check your connection, then use Retry Upload."
            }
            ErrorKind::Unknown => {
                "Something went wrong. Run diagnostics or try again in a moment."
            }
        }
    }

    /// Whether a "Retry Upload" button makes sense for this outcome
    pub fn offers_manual_retry(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::RetryLimitExceeded | ErrorKind::Unknown
        )
    }
}

impl From<ValidationError> for UploadError {
    fn from(err: ValidationError) -> Self {
        UploadError::ValidationFailed(err)
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err.code {
            StorageErrorCode::Unauthorized => UploadError::Unauthorized(err.message),
            StorageErrorCode::Canceled => UploadError::Cancelled,
            // The collaborator gave up on its own internal retries
            StorageErrorCode::RetryLimitExceeded => UploadError::RetryLimitExceeded { attempts: 1 },
            StorageErrorCode::QuotaExceeded
            | StorageErrorCode::NotFound
            | StorageErrorCode::Network
            | StorageErrorCode::Unknown => UploadError::Unknown(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let err: UploadError = StorageError::unauthorized("token expired").into();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.to_string(), "Unauthorized: token expired");

        let err: UploadError = StorageError::canceled().into();
        assert_eq!(err, UploadError::Cancelled);

        let err: UploadError =
            StorageError::new(StorageErrorCode::QuotaExceeded, "bucket full").into();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_manual_retry_offers() {
        assert!(UploadError::Timeout { secs: 120 }.offers_manual_retry());
        assert!(UploadError::RetryLimitExceeded { attempts: 3 }.offers_manual_retry());
        assert!(!UploadError::Cancelled.offers_manual_retry());
        assert!(!UploadError::Unauthorized("x".into()).offers_manual_retry());
    }

    #[test]
    fn test_stalled_message() {
        let err = UploadError::Stalled { percent: 45.4 };
        assert_eq!(err.to_string(), "Upload stalled at 45%");
    }
}
