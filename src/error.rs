//! Crate-wide error kinds.
//!
//! Every domain operation returns [`Error`]; the HTTP layer in [`crate::http`]
//! translates each variant to a stable status code and error code in the
//! response body.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("no responder for askerRole={asker_role}, questionType={question_type}, escalationLevel={escalation_level}")]
    NoResponder {
        asker_role: String,
        question_type: String,
        escalation_level: i64,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error(transparent)]
    Database(sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// SQLite surfaces write contention (`SQLITE_BUSY`/`SQLITE_LOCKED`) as a
/// plain `sqlx::Error::Database`, indistinguishable by type from a
/// permanent schema/constraint error. Classify those codes as `Conflict` so
/// every `?`-propagated sqlx call — not just the call sites that already
/// match on it explicitly — feeds the same bounded-retry path.
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() || is_sqlite_busy(db_err.as_ref()) {
                return Error::Conflict(db_err.message().to_string());
            }
        }
        Error::Database(e)
    }
}

fn is_sqlite_busy(db_err: &dyn sqlx::error::DatabaseError) -> bool {
    db_err.code().map(|c| c == "5" || c == "6").unwrap_or(false)
        || db_err.message().contains("database is locked")
        || db_err.message().contains("database table is locked")
}

impl Error {
    /// Stable machine-readable code for the HTTP boundary, independent of
    /// the human-readable `Display` message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "ConflictError",
            Error::IllegalTransition(_) => "IllegalTransition",
            Error::NoResponder { .. } => "NoResponder",
            Error::PermissionDenied(_) => "PermissionDenied",
            Error::Backpressure(_) => "Backpressure",
            Error::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Error::Invalid(_) => "Invalid",
            Error::Database(_) => "Invalid",
        }
    }

    /// Whether the core should retry this internally with bounded backoff
    /// before surfacing it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Backpressure(_))
    }
}
