//! PostgreSQL backend tests. Set DATABASE_URL to run them.

use db_parley::config::DatabaseConfig;
use db_parley::db::{DatabaseClient, PostgresClient, Value};
use db_parley::error::ExecutionErrorKind;

fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

async fn get_test_client() -> Option<PostgresClient> {
    let url = get_test_database_url()?;
    PostgresClient::connect(&url, &DatabaseConfig::default())
        .await
        .ok()
}

#[tokio::test]
async fn test_execute_respects_limit() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let result = client
        .execute_query("SELECT generate_series(1, 20) AS n", 5)
        .await
        .unwrap();

    assert_eq!(result.columns.len(), 1);
    assert_eq!(result.columns[0].name, "n");
    assert_eq!(result.rows.len(), 5);
    assert!(result.was_truncated);
    assert_eq!(result.rows[0][0], Value::Int(1));

    client.close().await;
}

#[tokio::test]
async fn test_empty_result_keeps_columns() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let result = client
        .execute_query("SELECT 1 AS a, 'x' AS b WHERE false", 10)
        .await
        .unwrap();

    assert_eq!(result.columns.len(), 2);
    assert!(result.rows.is_empty());

    client.close().await;
}

#[tokio::test]
async fn test_describe_does_not_execute() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let columns = client
        .describe("SELECT 1 AS id, now() AS created_at")
        .await
        .unwrap();

    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "created_at"]);

    client.close().await;
}

#[tokio::test]
async fn test_unknown_table_is_syntax_error() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let error = client
        .execute_query("SELECT * FROM table_that_does_not_exist_xyz", 10)
        .await
        .unwrap_err();
    assert_eq!(error.kind, ExecutionErrorKind::SyntaxError);

    client.close().await;
}

