//! Direct statement execution through `run_sql`.

use db_parley::error::{ErrorKind, ParleyError};
use db_parley::llm::MockLlmClient;
use db_parley::persistence;
use db_parley::query::MASKED_VALUE;
use db_parley::service::RunSqlRequest;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use super::common::Harness;

fn request(harness: &Harness, sql: &str) -> RunSqlRequest {
    RunSqlRequest::new(harness.conversation_id, sql)
}

#[tokio::test]
async fn test_limit_truncates_rows() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::new());
    let linked_id = Uuid::new_v4();

    let result = coordinator
        .run_sql(RunSqlRequest {
            linked_id,
            limit: 2,
            ..request(&harness, "SELECT * FROM people ORDER BY id")
        })
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["id", "name", "email", "age", "city"]);
    assert_eq!(result.rows.len(), 2);
    assert!(result.truncated);
    assert!(!result.for_chart);
    assert_eq!(result.linked_id, linked_id);
    assert_eq!(result.rows[0][1], serde_json::json!("Ada"));
}

#[tokio::test]
async fn test_repeated_read_is_identical() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::new());
    let linked_id = Uuid::new_v4();
    let sql = "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 20000) \
               SELECT COUNT(*) AS total, (SELECT name FROM people ORDER BY age LIMIT 1) AS youngest FROM n";

    let mut outputs = Vec::new();
    for _ in 0..3 {
        let result = coordinator
            .run_sql(RunSqlRequest {
                linked_id,
                ..request(&harness, sql)
            })
            .await
            .unwrap();
        outputs.push(serde_json::to_string(&result).unwrap());
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
    assert!(outputs[0].contains("Linus"));
}

#[tokio::test]
async fn test_dry_run_returns_columns_only() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::new());

    let result = coordinator
        .run_sql(RunSqlRequest {
            execute: false,
            ..request(&harness, "SELECT id, name FROM users")
        })
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["id", "name"]);
    assert!(result.rows.is_empty());
}

#[tokio::test]
async fn test_dry_run_does_not_modify() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::new());

    coordinator
        .run_sql(RunSqlRequest {
            execute: false,
            ..request(&harness, "DELETE FROM people WHERE age > 40")
        })
        .await
        .unwrap();

    assert_eq!(harness.people_count().await, 5);
}

#[tokio::test]
async fn test_write_refused() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::new());

    let error = coordinator
        .run_sql(request(&harness, "DELETE FROM people"))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::PermissionDenied);
    assert_eq!(harness.people_count().await, 5);
}

#[tokio::test]
async fn test_unknown_table_is_syntax_error() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::new());

    let error = coordinator
        .run_sql(request(&harness, "SELECT * FROM missing_table"))
        .await
        .unwrap_err();

    assert!(matches!(error, ParleyError::Execution(_)));
    assert_eq!(error.kind(), ErrorKind::SyntaxError);
}

#[tokio::test]
async fn test_secure_masks_values() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::new());

    let result = coordinator
        .run_sql(RunSqlRequest {
            secure: true,
            ..request(&harness, "SELECT name, email FROM people ORDER BY id")
        })
        .await
        .unwrap();

    assert!(result.secure);
    assert_eq!(result.rows.len(), 5);
    assert!(result
        .rows
        .iter()
        .flatten()
        .all(|v| v == &serde_json::json!(MASKED_VALUE)));
}

#[tokio::test]
async fn test_deleted_conversation_is_not_found() {
    let harness = Harness::new().await;
    persistence::delete_conversation(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap();
    let coordinator = harness.coordinator(MockLlmClient::new());

    let error = coordinator
        .run_sql(request(&harness, "SELECT 1"))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_run_sql_stores_nothing() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::new());

    coordinator
        .run_sql(request(&harness, "SELECT COUNT(*) FROM users"))
        .await
        .unwrap();

    assert!(persistence::list_messages(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap()
        .is_empty());
}
