//! Core error types for tg-archive

use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for tg-archive
#[derive(Error, Debug)]
pub enum Error {
    #[error("Telegram client error: {0}")]
    Telegram(String),

    /// Upstream rate limit carrying the server-requested wait.
    #[error("rate limited, retry after {wait_seconds}s")]
    RateLimited { wait_seconds: u64 },

    /// Permanent upstream denial (private channel, admin rights required).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("search engine error: {0}")]
    Search(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Bad command syntax, page out of range and the like. Surfaced to the
    /// end user as a chat reply, never logged as an error.
    #[error("{0}")]
    UserInput(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task join error: {0}")]
    Join(#[from] JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the sync manager should treat this as a transient failure
    /// worth another iteration, as opposed to marking the chat failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::Request(_) | Error::Http { status: 500..=599, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::RateLimited { wait_seconds: 3 }.is_transient());
        assert!(
            Error::Http {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(!Error::PermissionDenied("private".into()).is_transient());
        assert!(!Error::UserInput("bad page".into()).is_transient());
    }

    #[test]
    fn test_user_input_display_is_bare() {
        let e = Error::UserInput("Page must be between 1 and 100".into());
        assert_eq!(e.to_string(), "Page must be between 1 and 100");
    }
}
