//! SQL parsing and classification logic.
//!
//! Uses sqlparser-rs with the dialect of the target backend and takes the
//! most dangerous level found anywhere in the statement tree.

use sqlparser::ast::{Query, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

use crate::db::DatabaseBackend;

use super::{Classification, SafetyLevel, StatementKind};

type Verdict = (SafetyLevel, StatementKind);

const READ: Verdict = (SafetyLevel::ReadOnly, StatementKind::Select);

/// SQL classifier bound to one backend dialect.
pub struct SqlClassifier {
    dialect: Box<dyn Dialect + Send + Sync>,
}

impl std::fmt::Debug for SqlClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlClassifier").finish_non_exhaustive()
    }
}

impl Default for SqlClassifier {
    fn default() -> Self {
        Self::for_backend(DatabaseBackend::Postgres)
    }
}

impl SqlClassifier {
    pub fn for_backend(backend: DatabaseBackend) -> Self {
        let dialect: Box<dyn Dialect + Send + Sync> = match backend {
            DatabaseBackend::Postgres => Box::new(PostgreSqlDialect {}),
            DatabaseBackend::Sqlite => Box::new(SQLiteDialect {}),
        };
        Self { dialect }
    }

    /// Classifies a SQL string. Unparsable or empty input is destructive.
    pub fn classify(&self, sql: &str) -> Classification {
        let statements = match Parser::parse_sql(self.dialect.as_ref(), sql) {
            Ok(statements) => statements,
            Err(e) => return Classification::unparsable(format!("SQL parse error: {e}")),
        };

        match statements.as_slice() {
            [] => Classification::unparsable("Empty SQL statement"),
            [single] => {
                let (level, kind) = classify_statement(single);
                Classification::new(level, kind)
            }
            many => {
                let (level, kind) = many
                    .iter()
                    .map(classify_statement)
                    .fold(READ, most_dangerous);
                Classification::new(level, StatementKind::Multiple(Box::new(kind)))
            }
        }
    }
}

/// Classifies with the PostgreSQL dialect.
pub fn classify_sql(sql: &str) -> Classification {
    SqlClassifier::default().classify(sql)
}

fn most_dangerous(a: Verdict, b: Verdict) -> Verdict {
    if b.0 > a.0 {
        b
    } else {
        a
    }
}

fn classify_statement(statement: &Statement) -> Verdict {
    use SafetyLevel::{Destructive, Mutating, ReadOnly};

    match statement {
        Statement::Query(query) => classify_query(query),
        Statement::Explain {
            analyze, statement, ..
        } => {
            // EXPLAIN ANALYZE runs the inner statement
            let level = if *analyze {
                classify_statement(statement).0
            } else {
                ReadOnly
            };
            (level, StatementKind::Explain)
        }
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => (ReadOnly, StatementKind::Show),
        Statement::Pragma { value: None, .. } => (ReadOnly, StatementKind::Pragma),
        Statement::Pragma { .. } => (Mutating, StatementKind::Pragma),

        Statement::Insert { .. } => (Mutating, StatementKind::Insert),
        Statement::Update { .. } => (Mutating, StatementKind::Update),
        Statement::Merge { .. } => (Mutating, StatementKind::Merge),

        Statement::Delete { .. } => (Destructive, StatementKind::Delete),
        Statement::Drop { .. } => (Destructive, StatementKind::Drop),
        Statement::Truncate { .. } => (Destructive, StatementKind::Truncate),
        Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. } => (Destructive, StatementKind::Alter),
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateRole { .. }
        | Statement::CreateSequence { .. } => (Destructive, StatementKind::Create),
        Statement::Grant { .. } => (Destructive, StatementKind::Grant),
        Statement::Revoke { .. } => (Destructive, StatementKind::Revoke),

        _ => (Destructive, StatementKind::Unknown),
    }
}

fn classify_query(query: &Query) -> Verdict {
    let ctes = query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter())
        .map(|cte| classify_query(&cte.query));

    ctes.chain(std::iter::once(classify_set_expr(&query.body)))
        .fold(READ, most_dangerous)
}

fn classify_set_expr(set_expr: &SetExpr) -> Verdict {
    match set_expr {
        SetExpr::Select(select) => select
            .from
            .iter()
            .map(classify_table_with_joins)
            .fold(READ, most_dangerous),
        SetExpr::Query(query) => classify_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            most_dangerous(classify_set_expr(left), classify_set_expr(right))
        }
        SetExpr::Insert(stmt) | SetExpr::Update(stmt) => classify_statement(stmt),
        SetExpr::Values(_) | SetExpr::Table(_) => READ,
        #[allow(unreachable_patterns)]
        _ => (SafetyLevel::Destructive, StatementKind::Unknown),
    }
}

fn classify_table_with_joins(twj: &TableWithJoins) -> Verdict {
    std::iter::once(&twj.relation)
        .chain(twj.joins.iter().map(|join| &join.relation))
        .map(classify_table_factor)
        .fold(READ, most_dangerous)
}

fn classify_table_factor(factor: &TableFactor) -> Verdict {
    match factor {
        TableFactor::Derived { subquery, .. } => classify_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => classify_table_with_joins(table_with_joins),
        _ => READ,
    }
}
