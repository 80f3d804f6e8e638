//! Substrate error taxonomy.
//!
//! Every fallible public operation returns [`Error`]. Callers branch on
//! [`Error::kind`] rather than on variants: several variants share a kind
//! (a pool timeout and an SMTP failure are both [`ErrorKind::Transient`]).

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::{any::Any, time::Duration};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed option at construction.
    Configuration,
    /// Caller supplied an invalid argument.
    Validation,
    /// No such row, object or template.
    NotFound,
    /// Invalid state transition.
    Conflict,
    /// TTL-bounded resource past expiry.
    Expired,
    /// Network, pool or SMTP failure; the caller may retry.
    Transient,
    /// Unhandled defect recovered by a boundary.
    Panic,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Expired => "expired",
            Self::Transient => "transient",
            Self::Panic => "panic",
        }
    }

    #[must_use]
    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Expired => StatusCode::GONE,
            Self::Transient => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration | Self::Panic => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("expired: {0}")]
    Expired(String),
    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("panic: {0}")]
    Panic(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("migration {migration} failed: {source}")]
    Migration {
        migration: String,
        source: sqlx::Error,
    },
    #[error("{source}; rollback failed: {rollback}")]
    Rollback {
        source: Box<Error>,
        rollback: sqlx::Error,
    },
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Expired(_) => ErrorKind::Expired,
            Self::Timeout(_) | Self::Transient(_) => ErrorKind::Transient,
            Self::Panic(_) => ErrorKind::Panic,
            Self::Database(err) => database_kind(err),
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::InvalidInput => ErrorKind::Validation,
                _ => ErrorKind::Transient,
            },
            Self::Rollback { source, .. } => source.kind(),
            Self::Migration { source, .. } => database_kind(source),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }
}

fn database_kind(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Configuration(_) => ErrorKind::Configuration,
        sqlx::Error::Database(db) if db.is_unique_violation() => ErrorKind::Conflict,
        sqlx::Error::Database(db) if db.is_foreign_key_violation() || db.is_check_violation() => {
            ErrorKind::Validation
        }
        _ => ErrorKind::Transient,
    }
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        match err.kind() {
            minijinja::ErrorKind::TemplateNotFound => Self::NotFound(err.to_string()),
            _ => Self::Validation(format!("template error: {err:#}")),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Validation(format!("invalid url: {err}"))
    }
}

/// Best-effort message out of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorKind,
    message: &'a str,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let kind = self.kind();
        // Internal details stay in the logs.
        let message = match kind {
            ErrorKind::Configuration | ErrorKind::Panic => "internal error".to_string(),
            ErrorKind::Transient => "service unavailable".to_string(),
            _ => self.to_string(),
        };
        if kind.status_code().is_server_error() {
            tracing::error!(error = %self, kind = kind.as_str(), "request failed");
        }
        (
            kind.status_code(),
            Json(ErrorBody {
                error: kind,
                message: &message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = Error::from(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.kind().status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn timeout_is_transient_and_mentions_deadline() {
        let err = Error::Timeout(Duration::from_millis(50));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn rollback_keeps_original_kind() {
        let err = Error::Rollback {
            source: Box::new(Error::conflict("status transition")),
            rollback: sqlx::Error::PoolClosed,
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("rollback failed"));
    }

    #[test]
    fn failed_migration_is_not_a_client_error() {
        let err = Error::Migration {
            migration: "20240101000000_create_accounts.sql".to_string(),
            source: sqlx::Error::PoolTimedOut,
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn client_errors_stay_client_errors() {
        for (err, status) in [
            (Error::validation("empty key"), StatusCode::BAD_REQUEST),
            (Error::not_found("object"), StatusCode::NOT_FOUND),
            (Error::conflict("state"), StatusCode::CONFLICT),
            (Error::Expired("intent".into()), StatusCode::GONE),
        ] {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn missing_template_is_not_found() {
        let env = minijinja::Environment::new();
        let err = match env.get_template("nope.html") {
            Ok(_) => Error::validation("unexpected"),
            Err(err) => Error::from(err),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn panic_messages() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(from_str.as_ref()), "boom");
        assert_eq!(panic_message(from_string.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
