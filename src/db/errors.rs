//! Narrowing of driver errors into `ExecutionError`.

use super::DatabaseBackend;
use crate::error::{ExecutionError, ExecutionErrorKind};

/// Classifies a sqlx error raised while running a statement.
pub(crate) fn classify_sqlx_error(backend: DatabaseBackend, error: sqlx::Error) -> ExecutionError {
    let kind = match &error {
        sqlx::Error::Database(db_error) => match backend {
            DatabaseBackend::Postgres => db_error
                .code()
                .map(|code| classify_sqlstate(&code))
                .unwrap_or(ExecutionErrorKind::Unknown),
            DatabaseBackend::Sqlite => db_error
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(classify_sqlite_code)
                .unwrap_or(ExecutionErrorKind::Unknown),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Configuration(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ExecutionErrorKind::ConnectionFailure,
        _ => ExecutionErrorKind::Unknown,
    };

    ExecutionError::new(kind, format_query_error(error))
}

/// Maps a PostgreSQL SQLSTATE onto an execution error kind.
fn classify_sqlstate(code: &str) -> ExecutionErrorKind {
    match code {
        "42501" => ExecutionErrorKind::PermissionDenied,
        "57014" => ExecutionErrorKind::Timeout,
        c if c.starts_with("42") => ExecutionErrorKind::SyntaxError,
        c if c.starts_with("08") => ExecutionErrorKind::ConnectionFailure,
        c if c.starts_with("28") => ExecutionErrorKind::PermissionDenied,
        "25006" => ExecutionErrorKind::PermissionDenied,
        _ => ExecutionErrorKind::Unknown,
    }
}

/// Maps a SQLite (possibly extended) result code onto an execution error kind.
fn classify_sqlite_code(code: i64) -> ExecutionErrorKind {
    match code & 0xff {
        // SQLITE_ERROR covers parse failures and unknown tables/columns
        1 => ExecutionErrorKind::SyntaxError,
        3 | 8 | 23 => ExecutionErrorKind::PermissionDenied,
        5 | 6 | 9 => ExecutionErrorKind::Timeout,
        10 | 14 | 26 => ExecutionErrorKind::ConnectionFailure,
        _ => ExecutionErrorKind::Unknown,
    }
}

/// Determines if a connection error is transient and worth retrying.
pub(crate) fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
        || error_str.contains("does not exist")
    {
        return false;
    }

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Formats a statement error with the PostgreSQL detail and hint if present.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = db_error.message().to_string();

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
    }

    result
}
