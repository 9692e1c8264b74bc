//! State database tests through the public API.

use db_parley::error::ErrorKind;
use db_parley::llm::Role;
use db_parley::persistence::{self, StateDb};
use db_parley::query::TransportResult;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use uuid::Uuid;

async fn open_state(dir: &TempDir) -> StateDb {
    StateDb::open(&dir.path().join("state.db"), 2).await.unwrap()
}

fn sample_result(linked_id: Uuid) -> TransportResult {
    TransportResult {
        columns: vec!["count".to_string()],
        rows: vec![vec![serde_json::json!(3)]],
        for_chart: false,
        linked_id,
        secure: false,
        truncated: false,
    }
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();

    let (connection_id, conversation_id) = {
        let state = open_state(&dir).await;
        let connection = persistence::create_connection(state.pool(), "local", "sqlite:app.db")
            .await
            .unwrap();
        let conversation =
            persistence::create_conversation(state.pool(), connection.id, "first")
                .await
                .unwrap();

        let mut uow = state.begin();
        uow.add_message(conversation.id, Role::User, "how many users?");
        let answer = uow.add_message(conversation.id, Role::Assistant, "There are 3 users.");
        uow.add_result(answer, "SELECT COUNT(*) FROM users", sample_result(Uuid::new_v4()));
        assert_eq!(uow.commit().await.unwrap(), 3);

        state.close().await;
        (connection.id, conversation.id)
    };

    let state = open_state(&dir).await;
    let connection = persistence::get_connection(state.pool(), connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.name, "local");

    let messages = persistence::list_messages(state.pool(), conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].results.len(), 1);
    assert_eq!(messages[1].results[0].sql, "SELECT COUNT(*) FROM users");

    state.close().await;
}

#[tokio::test]
async fn test_conversation_lifecycle() {
    let dir = TempDir::new().unwrap();
    let state = open_state(&dir).await;
    let pool = state.pool();

    let connection = persistence::create_connection(pool, "local", "sqlite:app.db")
        .await
        .unwrap();
    let first = persistence::create_conversation(pool, connection.id, "first")
        .await
        .unwrap();
    let second = persistence::create_conversation(pool, connection.id, "second")
        .await
        .unwrap();

    persistence::rename_conversation(pool, first.id, "renamed")
        .await
        .unwrap();
    let renamed = persistence::get_conversation(pool, first.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.name, "renamed");

    assert!(persistence::delete_conversation(pool, second.id).await.unwrap());
    let remaining = persistence::list_conversations(pool, Some(connection.id))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, first.id);

    assert!(!persistence::delete_conversation(pool, second.id).await.unwrap());
    let error = persistence::rename_conversation(pool, second.id, "gone")
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);

    state.close().await;
}

#[tokio::test]
async fn test_deleted_connection_refuses_new_conversations() {
    let dir = TempDir::new().unwrap();
    let state = open_state(&dir).await;
    let pool = state.pool();

    let connection = persistence::create_connection(pool, "local", "sqlite:app.db")
        .await
        .unwrap();
    let existing = persistence::create_conversation(pool, connection.id, "kept")
        .await
        .unwrap();
    assert!(persistence::delete_connection(pool, connection.id).await.unwrap());

    assert!(persistence::list_connections(pool).await.unwrap().is_empty());
    let error = persistence::create_conversation(pool, connection.id, "new")
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);

    // Existing rows keep their foreign key.
    assert!(persistence::get_conversation(pool, existing.id)
        .await
        .unwrap()
        .is_some());

    state.close().await;
}

#[tokio::test]
async fn test_rolled_back_turn_leaves_no_rows() {
    let dir = TempDir::new().unwrap();
    let state = open_state(&dir).await;

    let connection = persistence::create_connection(state.pool(), "local", "sqlite:app.db")
        .await
        .unwrap();
    let conversation = persistence::create_conversation(state.pool(), connection.id, "c")
        .await
        .unwrap();

    let mut uow = state.begin();
    uow.add_message(conversation.id, Role::User, "question");
    uow.add_message(conversation.id, Role::System, "Query failed");
    assert_eq!(uow.rollback(), 2);

    assert!(persistence::list_messages(state.pool(), conversation.id)
        .await
        .unwrap()
        .is_empty());

    state.close().await;
}
