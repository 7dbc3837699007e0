//! Failure contract shared by the search, model, and delivery collaborators.

use std::future::Future;
use std::time::Duration;

/// An error reported by an external provider call.
///
/// Only [`ProviderError::Transient`] errors are eligible for retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Rate limit, timeout, connection reset, or 5xx.
    #[error("{message}")]
    Transient {
        message: String,
        /// Provider-requested wait before the next attempt.
        retry_after: Option<Duration>,
    },
    /// Rejected request, bad credentials, malformed response.
    #[error("{message}")]
    Permanent { message: String },
}

impl ProviderError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            retry_after: None,
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent {
            message: msg.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            Self::Permanent { .. } => None,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, detail: impl std::fmt::Display) -> Self {
        let message = format!("HTTP {status}: {detail}");
        match status {
            408 | 425 | 429 | 500..=599 => Self::transient(message),
            _ => Self::permanent(message),
        }
    }
}

/// Run `call` with a deadline. Exceeding it is a transient failure of that call.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::transient(format!(
            "timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
