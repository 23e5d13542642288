use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DraftId;

/// Result type for upload pipeline operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors reported by the remote upload service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service answered with a machine-readable error code
    #[error("remote responded with code {code}: {message}")]
    Response { code: i64, message: String },

    #[error("remote request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Create a response error carrying a service error code
    pub fn response<S: Into<String>>(code: i64, message: S) -> Self {
        Self::Response {
            code,
            message: message.into(),
        }
    }

    /// Create a transport-level error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// The service error code, if the service produced one
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Response { code, .. } => Some(*code),
            Self::Timeout | Self::Transport(_) => None,
        }
    }
}

/// Errors that can occur while running the upload pipeline
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Remote service error: {0}")]
    Remote(#[from] RemoteError),

    /// Cooperative cancellation; never persisted as a failure
    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Draft not found: {draft_id}")]
    DraftNotFound { draft_id: DraftId },

    #[error("Draft {draft_id} already has a running upload")]
    AlreadyRunning { draft_id: DraftId },

    #[error("Draft {draft_id} is blocked until remote space is freed")]
    Blocked { draft_id: DraftId },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Invalid remote response: {message}")]
    InvalidResponse { message: String },

    #[error("Persistence failure: {message}")]
    Persistence { message: String },

    #[error("Encryption failure: {message}")]
    Encryption { message: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an invalid response error
    pub fn invalid_response<S: Into<String>>(message: S) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create an encryption error
    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The underlying remote error, if any
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// Classification of an unrecovered pipeline error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or server-side hiccup; the caller may retry
    Transient,
    /// Remote has no room for more data; parked until space is freed
    QuotaExceeded,
    /// A store write failed and was rolled back
    Persistence,
    /// Anything else; surfaced to the caller, never retried by the pipeline
    Fatal,
}

/// Maps remote error codes to error classes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPolicy {
    /// Codes meaning the account has no space left
    pub quota_exceeded_codes: Vec<i64>,

    /// Codes meaning an upload target is no longer valid
    pub expired_target_codes: Vec<i64>,

    /// Codes the seal call answers when the revision was already sealed
    pub already_committed_codes: Vec<i64>,

    /// Codes meaning the remote rejected the uploaded revision as a whole
    pub invalid_revision_codes: Vec<i64>,

    /// Codes treated as transient server failures
    pub transient_codes: std::ops::RangeInclusive<i64>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            quota_exceeded_codes: vec![200_001],
            expired_target_codes: vec![2501],
            already_committed_codes: vec![2500],
            invalid_revision_codes: vec![2511],
            transient_codes: 500..=599,
        }
    }
}

impl ErrorPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the quota-exceeded code set
    pub fn with_quota_exceeded_codes(mut self, codes: Vec<i64>) -> Self {
        self.quota_exceeded_codes = codes;
        self
    }

    /// Replace the expired-target code set
    pub fn with_expired_target_codes(mut self, codes: Vec<i64>) -> Self {
        self.expired_target_codes = codes;
        self
    }

    /// Replace the already-committed code set
    pub fn with_already_committed_codes(mut self, codes: Vec<i64>) -> Self {
        self.already_committed_codes = codes;
        self
    }

    /// Replace the invalid-revision code set
    pub fn with_invalid_revision_codes(mut self, codes: Vec<i64>) -> Self {
        self.invalid_revision_codes = codes;
        self
    }

    pub fn is_quota_exceeded(&self, error: &RemoteError) -> bool {
        matches!(error.code(), Some(code) if self.quota_exceeded_codes.contains(&code))
    }

    pub fn is_expired_target(&self, error: &RemoteError) -> bool {
        matches!(error.code(), Some(code) if self.expired_target_codes.contains(&code))
    }

    /// A previous seal of this revision already went through
    pub fn is_already_committed(&self, error: &RemoteError) -> bool {
        matches!(error.code(), Some(code) if self.already_committed_codes.contains(&code))
    }

    pub fn is_invalid_revision(&self, error: &RemoteError) -> bool {
        matches!(error.code(), Some(code) if self.invalid_revision_codes.contains(&code))
    }

    /// Classify a pipeline error.
    ///
    /// Unknown codes fall through to [`ErrorClass::Fatal`]. Callers must not
    /// pass [`UploadError::Cancelled`]; it is an outcome, not a failure.
    pub fn classify(&self, error: &UploadError) -> ErrorClass {
        match error {
            UploadError::Remote(remote) => self.classify_remote(remote),
            UploadError::Persistence { .. } | UploadError::Serialization { .. } => {
                ErrorClass::Persistence
            }
            _ => ErrorClass::Fatal,
        }
    }

    fn classify_remote(&self, error: &RemoteError) -> ErrorClass {
        match error {
            RemoteError::Timeout | RemoteError::Transport(_) => ErrorClass::Transient,
            RemoteError::Response { code, .. } => {
                if self.quota_exceeded_codes.contains(code) {
                    ErrorClass::QuotaExceeded
                } else if self.expired_target_codes.contains(code)
                    || self.invalid_revision_codes.contains(code)
                    || self.transient_codes.contains(code)
                {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
        }
    }
}
