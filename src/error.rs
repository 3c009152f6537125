//! Error taxonomy shared by the pipeline components.
//!
//! Policy outcomes (lock contention, quiet hours, quota) are not errors and
//! live in `crate::model` as enum variants.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoutError {
    /// Missing or unusable credentials/secrets. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provider answered with a non-success status.
    #[error("upstream error {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The provider could not be reached at all.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The search provider returned data outside what was asked for.
    #[error("provider contract violation: {0}")]
    ContractViolation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl ScoutError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ScoutError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ScoutError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ScoutError::Timeout("provider response");
        }
        match err.status() {
            Some(status) => ScoutError::Upstream {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => ScoutError::Transport(err.to_string()),
        }
    }
}

pub type ScoutResult<T> = Result<T, ScoutError>;

/// Map a repository error back onto the storage variant.
pub(crate) fn storage(err: anyhow::Error) -> ScoutError {
    match err.downcast::<sqlx::Error>() {
        Ok(sqlx_err) => ScoutError::Storage(sqlx_err),
        Err(other) => ScoutError::Storage(sqlx::Error::Protocol(other.to_string())),
    }
}
