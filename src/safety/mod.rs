//! Statement safety classification.
//!
//! Decides whether a model-proposed statement only reads data. Anything
//! else is refused by the executor unless writes are explicitly allowed.

mod parser;

pub use parser::{classify_sql, SqlClassifier};

use std::fmt;

/// How much a statement can change the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SafetyLevel {
    /// Reads only (SELECT, EXPLAIN, SHOW, read-only PRAGMA).
    ReadOnly,
    /// Modifies rows (INSERT, UPDATE, MERGE).
    Mutating,
    /// Deletes data, changes schema or privileges, or could not be parsed.
    Destructive,
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadOnly => "read-only",
            Self::Mutating => "mutating",
            Self::Destructive => "destructive",
        })
    }
}

/// Kind of statement detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Drop,
    Truncate,
    Alter,
    Create,
    Grant,
    Revoke,
    Explain,
    Show,
    Pragma,
    /// Several statements; holds the most dangerous one.
    Multiple(Box<StatementKind>),
    Unknown,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multiple(inner) => write!(f, "multiple ({inner})"),
            other => f.write_str(match other {
                Self::Select => "SELECT",
                Self::Insert => "INSERT",
                Self::Update => "UPDATE",
                Self::Delete => "DELETE",
                Self::Merge => "MERGE",
                Self::Drop => "DROP",
                Self::Truncate => "TRUNCATE",
                Self::Alter => "ALTER",
                Self::Create => "CREATE",
                Self::Grant => "GRANT",
                Self::Revoke => "REVOKE",
                Self::Explain => "EXPLAIN",
                Self::Show => "SHOW",
                Self::Pragma => "PRAGMA",
                _ => "unknown",
            }),
        }
    }
}

/// Outcome of classifying a SQL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub level: SafetyLevel,
    pub kind: StatementKind,
    /// Set when the statement could not be parsed.
    pub parse_error: Option<String>,
}

impl Classification {
    pub fn new(level: SafetyLevel, kind: StatementKind) -> Self {
        Self {
            level,
            kind,
            parse_error: None,
        }
    }

    pub fn unparsable(reason: impl Into<String>) -> Self {
        Self {
            level: SafetyLevel::Destructive,
            kind: StatementKind::Unknown,
            parse_error: Some(reason.into()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.level == SafetyLevel::ReadOnly
    }
}
