use thiserror::Error;

/// Errors surfaced by the core. Variants follow how callers react to them:
/// validation and not-found go back to the caller, external and timeout
/// trigger degradation, integrity and storage abort the current operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("external capability failed: {0}")]
    External(String),

    #[error("external capability rejected the request: {0}")]
    Rejected(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("data integrity violation: {0}")]
    Integrity(String),

    #[error("document parse failed: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// External failures that are worth a single retry. Requests the
    /// provider refused (bad key, malformed body) are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::External(_))
    }
}

/// Non-success HTTP status from a provider endpoint.
#[derive(Debug, Error)]
#[error("API error ({status}): {body}")]
pub struct ApiStatusError {
    pub status: u16,
    pub body: String,
}

impl ApiStatusError {
    /// 5xx, 408 and 429 may succeed on a second attempt.
    pub fn is_retryable(&self) -> bool {
        self.status >= 500 || self.status == 408 || self.status == 429
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ApiStatusError>() {
            Some(api) if !api.is_retryable() => Error::Rejected(format!("{:#}", err)),
            _ => Error::External(format!("{:#}", err)),
        }
    }
}
