//! Error taxonomy for the knowledge engine

use thiserror::Error;

/// Result type alias for the knowledge engine
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for the knowledge engine
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("access denied")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream dependency failed: {0}")]
    TransientUpstream(String),

    #[error("BudgetExceeded")]
    BudgetExceeded { tenant: String },

    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("permanent failure: {0}")]
    PermanentFailure(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors raised while turning an uploaded file into plain text
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("declared type {declared} does not match file content")]
    TypeMismatch { declared: String },

    #[error("file is unreadable: {0}")]
    Unreadable(String),

    #[error("document contains no extractable text")]
    EmptyDocument,

    #[error("PDF has no embedded text layer and OCR is not available")]
    ScannedPdf,

    #[error("extraction_timeout")]
    Timeout,
}

impl From<object_store::Error> for CoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => CoreError::NotFound(path),
            other => CoreError::TransientUpstream(other.to_string()),
        }
    }
}

impl CoreError {
    /// Whether a worker should requeue the task with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::TransientUpstream(_) | CoreError::Http(_) | CoreError::Database(_)
        )
    }

    /// Error kind tag for logging/metrics and boundary translation
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::PayloadTooLarge(_) => "payload_too_large",
            CoreError::Authorization(_) => "authorization",
            CoreError::NotFound(_) => "not_found",
            CoreError::TransientUpstream(_) => "transient_upstream",
            CoreError::BudgetExceeded { .. } => "budget_exceeded",
            CoreError::Extraction(_) => "extraction",
            CoreError::Classifier(_) => "classifier",
            CoreError::PermanentFailure(_) => "permanent_failure",
            CoreError::Conflict(_) => "conflict",
            CoreError::Database(_) => "database",
            CoreError::Io(_) => "io",
            CoreError::Serialization(_) => "serialization",
            CoreError::Http(_) => "http",
            CoreError::Config(_) => "config",
        }
    }

    /// Collapse into the permanent form a failed job records
    pub fn into_permanent(self) -> CoreError {
        if self.is_transient() {
            CoreError::PermanentFailure(format!("retries exhausted: {}", self))
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CoreError::TransientUpstream("503".into()).is_transient());
        assert!(!CoreError::Validation("bad".into()).is_transient());
        assert!(!CoreError::BudgetExceeded { tenant: "7".into() }.is_transient());
        assert!(!CoreError::Extraction(ExtractionError::EmptyDocument).is_transient());
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            CoreError::BudgetExceeded { tenant: "7".into() }.kind(),
            "budget_exceeded"
        );
        assert_eq!(
            CoreError::Extraction(ExtractionError::ScannedPdf).kind(),
            "extraction"
        );
    }

    #[test]
    fn test_budget_error_message_is_stable() {
        // job rows store this string as the human-readable error
        let err = CoreError::BudgetExceeded { tenant: "7".into() };
        assert_eq!(err.to_string(), "BudgetExceeded");
    }

    #[test]
    fn test_into_permanent_wraps_transient_only() {
        let wrapped = CoreError::TransientUpstream("reset".into()).into_permanent();
        assert_eq!(wrapped.kind(), "permanent_failure");

        let kept = CoreError::Extraction(ExtractionError::EmptyDocument).into_permanent();
        assert_eq!(kept.kind(), "extraction");
    }
}
