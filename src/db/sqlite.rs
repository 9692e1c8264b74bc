//! SQLite database client implementation.
//!
//! SQLite columns carry no enforced type, so values are decoded by the
//! storage class of each value rather than the declared column type.

use super::errors::classify_sqlx_error;
use super::{
    Column, ColumnInfo, DatabaseBackend, DatabaseClient, ForeignKey, QueryResult, Row, Schema,
    Table, Value,
};
use crate::config::DatabaseConfig;
use crate::error::ExecutionError;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as SqlxColumn, Executor, Row as SqlxRow, Statement, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

/// SQLite database client.
#[derive(Debug)]
pub struct SqliteClient {
    pool: SqlitePool,
    query_timeout: Duration,
}

impl SqliteClient {
    pub fn from_pool(pool: SqlitePool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            query_timeout: config.query_timeout(),
        }
    }

    /// Opens an existing SQLite database file named by the DSN.
    pub async fn connect(dsn: &str, config: &DatabaseConfig) -> Result<Self, ExecutionError> {
        let options = SqliteConnectOptions::from_str(dsn)
            .map_err(|e| ExecutionError::connection(format!("Invalid SQLite DSN: {e}")))?
            .busy_timeout(config.connect_timeout());

        // Every pooled connection to :memory: would see its own empty database
        let max_connections = if dsn.contains(":memory:") { 1 } else { 2 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|e| {
                ExecutionError::connection(format!("Cannot open SQLite database '{dsn}': {e}"))
            })?;

        debug!(dsn, "Connected to SQLite");
        Ok(Self::from_pool(pool, config))
    }

    fn map_err(&self, error: sqlx::Error) -> ExecutionError {
        classify_sqlx_error(DatabaseBackend::Sqlite, error)
    }

    async fn fetch_limited(&self, sql: &str, limit: usize) -> Result<QueryResult, ExecutionError> {
        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut columns: Option<Vec<ColumnInfo>> = None;
        let mut rows: Vec<Row> = Vec::new();
        let mut was_truncated = false;

        while let Some(row) = stream.try_next().await.map_err(|e| self.map_err(e))? {
            if columns.is_none() {
                columns = Some(column_info(&row));
            }
            if rows.len() == limit {
                was_truncated = true;
                break;
            }
            rows.push(convert_row(&row));
        }
        drop(stream);

        let columns = match columns {
            Some(columns) => columns,
            None => self.describe(sql).await.unwrap_or_default(),
        };

        Ok(QueryResult::with_data(columns, rows).truncated(was_truncated))
    }

    async fn fetch_tables(&self) -> Result<Vec<Table>, ExecutionError> {
        let table_names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.map_err(e))?;

        let mut tables = Vec::with_capacity(table_names.len());
        for name in table_names {
            let rows: Vec<(String, String, i64, Option<String>, i64)> = sqlx::query_as(
                r#"
                SELECT name, type, "notnull", dflt_value, pk
                FROM pragma_table_info(?1)
                ORDER BY cid
                "#,
            )
            .bind(&name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;

            let mut pk: Vec<(i64, String)> = Vec::new();
            let columns = rows
                .into_iter()
                .map(|(column, data_type, not_null, default, pk_pos)| {
                    if pk_pos > 0 {
                        pk.push((pk_pos, column.clone()));
                    }
                    Column {
                        name: column,
                        data_type,
                        is_nullable: not_null == 0,
                        default,
                    }
                })
                .collect();
            pk.sort();

            tables.push(Table {
                name,
                columns,
                primary_key: pk.into_iter().map(|(_, c)| c).collect(),
            });
        }

        Ok(tables)
    }

    async fn fetch_foreign_keys(&self, tables: &[Table]) -> Result<Vec<ForeignKey>, ExecutionError> {
        let mut foreign_keys = Vec::new();

        for table in tables {
            let rows: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
                r#"
                SELECT id, "table", "from", "to"
                FROM pragma_foreign_key_list(?1)
                ORDER BY id, seq
                "#,
            )
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;

            let mut current: Option<(i64, ForeignKey)> = None;
            for (id, to_table, from_column, to_column) in rows {
                if current.as_ref().map(|(cid, _)| *cid) != Some(id) {
                    if let Some((_, fk)) = current.take() {
                        foreign_keys.push(fk);
                    }
                    current = Some((
                        id,
                        ForeignKey::new(table.name.clone(), Vec::new(), to_table, Vec::new()),
                    ));
                }
                if let Some((_, fk)) = current.as_mut() {
                    // A missing target column refers to the target's primary key
                    let to_column = to_column.unwrap_or_else(|| primary_key_of(tables, &fk.to_table));
                    fk.from_columns.push(from_column);
                    fk.to_columns.push(to_column);
                }
            }
            if let Some((_, fk)) = current {
                foreign_keys.push(fk);
            }
        }

        Ok(foreign_keys)
    }
}

fn primary_key_of(tables: &[Table], name: &str) -> String {
    tables
        .iter()
        .find(|t| t.name == name)
        .and_then(|t| t.primary_key.first().cloned())
        .unwrap_or_else(|| "rowid".to_string())
}

#[async_trait]
impl DatabaseClient for SqliteClient {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Sqlite
    }

    async fn introspect_schema(&self) -> Result<Schema, ExecutionError> {
        let tables = self.fetch_tables().await?;
        let foreign_keys = self.fetch_foreign_keys(&tables).await?;

        Ok(Schema {
            tables,
            foreign_keys,
        })
    }

    async fn execute_query(&self, sql: &str, limit: usize) -> Result<QueryResult, ExecutionError> {
        let start = Instant::now();

        let result = tokio::time::timeout(self.query_timeout, self.fetch_limited(sql, limit))
            .await
            .map_err(|_| {
                ExecutionError::timeout(format!(
                    "Query timed out after {} seconds",
                    self.query_timeout.as_secs()
                ))
            })??;

        Ok(result.with_execution_time(start.elapsed()))
    }

    async fn describe(&self, sql: &str) -> Result<Vec<ColumnInfo>, ExecutionError> {
        let statement = tokio::time::timeout(self.query_timeout, (&self.pool).prepare(sql))
            .await
            .map_err(|_| ExecutionError::timeout("Statement preparation timed out"))?
            .map_err(|e| self.map_err(e))?;

        Ok(statement
            .columns()
            .iter()
            .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
            .collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

fn convert_row(row: &SqliteRow) -> Row {
    (0..row.len()).map(|i| convert_value(row, i)).collect()
}

/// Decodes a value by its runtime storage class.
fn convert_value(row: &SqliteRow, index: usize) -> Value {
    let storage_class = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_uppercase(),
        Err(_) => return Value::Null,
    };

    match storage_class.as_str() {
        "INTEGER" | "INT8" | "BIGINT" => row
            .try_get::<i64, _>(index)
            .map(Value::Int)
            .unwrap_or(Value::Null),
        "BOOLEAN" => row
            .try_get::<bool, _>(index)
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "REAL" | "FLOAT" | "DOUBLE" => row
            .try_get::<f64, _>(index)
            .map(Value::Float)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}
