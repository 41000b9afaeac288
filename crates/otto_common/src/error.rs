//! Error taxonomy for plan execution.
//!
//! Stable error codes shared by the executor, verifier, triggers and the
//! run store. Codes are persisted verbatim and used for failure clustering,
//! so variants here must never be renamed once released.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error code for a step or run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    SignatureInvalid,
    SignatureExpired,
    KeyUnknown,
    TrustTooLow,
    PolicyBlocked,
    ApprovalDenied,
    ApprovalTimeout,
    OsCapabilityMiss,
    WebElementNotFound,
    WebUploadFailed,
    DownloadTimeout,
    DownloadIncomplete,
    PdfParseError,
    FileNotFound,
    VerifierTimeout,
    VerifierFail,
    Timeout,
    QueueFull,
    Cancelled,
    Unsupported,
    Internal,
}

impl ErrorCode {
    /// Wire/storage representation, e.g. `WEB_ELEMENT_NOT_FOUND`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorCode::SignatureExpired => "SIGNATURE_EXPIRED",
            ErrorCode::KeyUnknown => "KEY_UNKNOWN",
            ErrorCode::TrustTooLow => "TRUST_TOO_LOW",
            ErrorCode::PolicyBlocked => "POLICY_BLOCKED",
            ErrorCode::ApprovalDenied => "APPROVAL_DENIED",
            ErrorCode::ApprovalTimeout => "APPROVAL_TIMEOUT",
            ErrorCode::OsCapabilityMiss => "OS_CAPABILITY_MISS",
            ErrorCode::WebElementNotFound => "WEB_ELEMENT_NOT_FOUND",
            ErrorCode::WebUploadFailed => "WEB_UPLOAD_FAILED",
            ErrorCode::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            ErrorCode::DownloadIncomplete => "DOWNLOAD_INCOMPLETE",
            ErrorCode::PdfParseError => "PDF_PARSE_ERROR",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::VerifierTimeout => "VERIFIER_TIMEOUT",
            ErrorCode::VerifierFail => "VERIFIER_FAIL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Parse a stored code back into the enum. Unknown codes map to Internal
    /// so old databases stay readable.
    pub fn parse(s: &str) -> ErrorCode {
        match s {
            "VALIDATION_FAILED" => ErrorCode::ValidationFailed,
            "SIGNATURE_INVALID" => ErrorCode::SignatureInvalid,
            "SIGNATURE_EXPIRED" => ErrorCode::SignatureExpired,
            "KEY_UNKNOWN" => ErrorCode::KeyUnknown,
            "TRUST_TOO_LOW" => ErrorCode::TrustTooLow,
            "POLICY_BLOCKED" => ErrorCode::PolicyBlocked,
            "APPROVAL_DENIED" => ErrorCode::ApprovalDenied,
            "APPROVAL_TIMEOUT" => ErrorCode::ApprovalTimeout,
            "OS_CAPABILITY_MISS" => ErrorCode::OsCapabilityMiss,
            "WEB_ELEMENT_NOT_FOUND" => ErrorCode::WebElementNotFound,
            "WEB_UPLOAD_FAILED" => ErrorCode::WebUploadFailed,
            "DOWNLOAD_TIMEOUT" => ErrorCode::DownloadTimeout,
            "DOWNLOAD_INCOMPLETE" => ErrorCode::DownloadIncomplete,
            "PDF_PARSE_ERROR" => ErrorCode::PdfParseError,
            "FILE_NOT_FOUND" => ErrorCode::FileNotFound,
            "VERIFIER_TIMEOUT" => ErrorCode::VerifierTimeout,
            "VERIFIER_FAIL" => ErrorCode::VerifierFail,
            "TIMEOUT" => ErrorCode::Timeout,
            "QUEUE_FULL" => ErrorCode::QueueFull,
            "CANCELLED" => ErrorCode::Cancelled,
            "UNSUPPORTED" => ErrorCode::Unsupported,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether the retry policy may re-attempt a step that failed with this
    /// code. Recovery-once codes (element miss, file search) are retryable
    /// here; the executor caps the extra recovery attempt separately.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::WebElementNotFound
                | ErrorCode::WebUploadFailed
                | ErrorCode::DownloadTimeout
                | ErrorCode::DownloadIncomplete
                | ErrorCode::FileNotFound
                | ErrorCode::VerifierTimeout
                | ErrorCode::VerifierFail
                | ErrorCode::Timeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured step failure: code, message, and recommended actions.
///
/// This is what the run store persists and what the first-error card in the
/// CLI renders.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct StepError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

impl StepError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hints: Vec::new(),
            step_index: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    pub fn at_step(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }
}

/// Map an I/O error from a file action onto the taxonomy.
pub fn io_step_error(err: &std::io::Error, context: &str) -> StepError {
    let code = match err.kind() {
        std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
        _ => ErrorCode::Internal,
    };
    StepError::new(code, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in [
            ErrorCode::ValidationFailed,
            ErrorCode::PolicyBlocked,
            ErrorCode::WebElementNotFound,
            ErrorCode::VerifierFail,
            ErrorCode::QueueFull,
            ErrorCode::Internal,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
    }

    #[test]
    fn test_unknown_code_maps_to_internal() {
        assert_eq!(ErrorCode::parse("SOMETHING_NEW"), ErrorCode::Internal);
    }

    #[test]
    fn test_retryability_table() {
        assert!(ErrorCode::WebElementNotFound.retryable());
        assert!(ErrorCode::Timeout.retryable());
        assert!(ErrorCode::FileNotFound.retryable());
        assert!(!ErrorCode::PolicyBlocked.retryable());
        assert!(!ErrorCode::ApprovalDenied.retryable());
        assert!(!ErrorCode::PdfParseError.retryable());
        assert!(!ErrorCode::Cancelled.retryable());
    }

    #[test]
    fn test_step_error_builder() {
        let err = StepError::new(ErrorCode::FileNotFound, "no match for *.pdf")
            .with_hint("check the roots list")
            .at_step(3);
        assert_eq!(err.code, ErrorCode::FileNotFound);
        assert_eq!(err.step_index, Some(3));
        assert_eq!(err.hints.len(), 1);
        assert_eq!(err.to_string(), "FILE_NOT_FOUND: no match for *.pdf");
    }

    #[test]
    fn test_serialized_code_is_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::WebElementNotFound).unwrap();
        assert_eq!(json, "\"WEB_ELEMENT_NOT_FOUND\"");
    }
}
