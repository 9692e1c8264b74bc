//! End-to-end query invocations against a real SQLite database.

use db_parley::config::FlowConfig;
use db_parley::error::ErrorKind;
use db_parley::flow::StreamEvent;
use db_parley::llm::{MockLlmClient, Role};
use db_parley::persistence::{self, StateDb};
use db_parley::query::MASKED_VALUE;
use db_parley::service::InvocationOutcome;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use super::common::{Harness, COUNT_USERS_REPLY};

fn result_ids(events: &[StreamEvent]) -> Vec<Uuid> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::SqlResult { result } => Some(result.linked_id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_users_count_scenario() {
    let harness = Harness::new().await;
    let coordinator =
        harness.coordinator(MockLlmClient::scripted([COUNT_USERS_REPLY, "There are 3 users."]));

    let events: Vec<StreamEvent> = coordinator
        .query(harness.conversation_id, "how many users?", false)
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    let StreamEvent::SqlProposed { step_id, sql, .. } = &events[0] else {
        panic!("expected a proposal, got {:?}", events[0]);
    };
    assert_eq!(sql, "SELECT COUNT(*) AS count FROM users");

    let StreamEvent::SqlResult { result } = &events[1] else {
        panic!("expected a result, got {:?}", events[1]);
    };
    assert_eq!(result.columns, vec!["count"]);
    assert_eq!(result.rows, vec![vec![serde_json::json!(3)]]);
    assert_eq!(result.linked_id, *step_id);

    let StreamEvent::FinalAnswer { text, message_id, .. } = &events[2] else {
        panic!("expected an answer, got {:?}", events[2]);
    };
    assert_eq!(text, "There are 3 users.");

    let messages = persistence::list_messages(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap();
    let answers: Vec<_> = messages.iter().filter(|m| m.role == Role::Assistant).collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].id, *message_id);
    assert_eq!(answers[0].results.len(), 1);
    assert_eq!(answers[0].results[0].linked_id, *step_id);
    assert_eq!(answers[0].results[0].result, *result);
}

#[tokio::test]
async fn test_committed_results_match_result_events() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(MockLlmClient::scripted([
        COUNT_USERS_REPLY,
        "```sql\nSELEC nothing\n```",
        "```sql\nSELECT name FROM users ORDER BY id\n```",
        "Ada, Grace and Linus.",
    ]));

    let events: Vec<StreamEvent> = coordinator
        .query(harness.conversation_id, "Who are the users?", false)
        .collect()
        .await;

    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::SqlFailed { .. })));
    assert!(matches!(events.last(), Some(StreamEvent::FinalAnswer { .. })));

    let messages = persistence::list_messages(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap();
    let stored: Vec<Uuid> = messages
        .iter()
        .flat_map(|m| m.results.iter().map(|r| r.linked_id))
        .collect();
    assert_eq!(stored, result_ids(&events));
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn test_step_limit_rolls_back() {
    let harness = Harness::new().await;
    let llm = MockLlmClient::scripted([COUNT_USERS_REPLY; 5]);
    let coordinator = harness.coordinator_with(
        llm.clone(),
        FlowConfig {
            max_steps: 2,
            ..FlowConfig::default()
        },
    );

    let events: Vec<StreamEvent> = coordinator
        .query(harness.conversation_id, "how many users?", false)
        .collect()
        .await;

    assert_eq!(llm.call_count(), 2);
    assert_eq!(result_ids(&events).len(), 2);
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error {
            kind: ErrorKind::StepLimitExceeded,
            ..
        })
    ));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(persistence::list_messages(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_model_failure_rolls_back() {
    let harness = Harness::new().await;
    let coordinator = harness.coordinator(
        MockLlmClient::scripted([COUNT_USERS_REPLY]).then_fail("upstream unavailable"),
    );

    let events: Vec<StreamEvent> = coordinator
        .query(harness.conversation_id, "how many users?", false)
        .collect()
        .await;

    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error {
            kind: ErrorKind::ModelUnavailable,
            ..
        })
    ));
    assert!(persistence::list_messages(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_disconnect_rolls_back() {
    let harness = Harness::new().await;
    let coordinator =
        harness.coordinator(MockLlmClient::scripted([COUNT_USERS_REPLY, "There are 3 users."]));

    let mut stream = coordinator.query(harness.conversation_id, "how many users?", false);
    let first = stream.next().await.unwrap();
    assert!(matches!(first, StreamEvent::SqlProposed { .. }));

    let outcome = stream.disconnect().await.unwrap();
    assert_eq!(
        outcome,
        InvocationOutcome::RolledBack {
            reason: ErrorKind::ConsumerDisconnected
        }
    );
    assert!(persistence::list_messages(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_secure_masks_stream_storage_and_model() {
    let harness = Harness::new().await;
    let llm = MockLlmClient::scripted([
        "```sql\nSELECT id, name FROM users ORDER BY id\n```",
        "There are three people.",
    ]);
    let coordinator = harness.coordinator(llm.clone());

    let events: Vec<StreamEvent> = coordinator
        .query(harness.conversation_id, "list all users", true)
        .collect()
        .await;

    let StreamEvent::SqlResult { result } = &events[1] else {
        panic!("expected a result, got {:?}", events[1]);
    };
    assert!(result.secure);
    assert_eq!(result.columns, vec!["id", "name"]);
    assert_eq!(result.rows.len(), 3);
    assert!(result
        .rows
        .iter()
        .flatten()
        .all(|v| v == &serde_json::json!(MASKED_VALUE)));

    let messages = persistence::list_messages(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap();
    let stored = &messages[1].results[0];
    assert!(stored.secure);
    assert_eq!(stored.result, *result);

    let requests = llm.requests();
    let observation = &requests[1].last().unwrap().content;
    assert!(observation.contains("3 row(s)"));
    assert!(!observation.contains("Grace"));
}

#[tokio::test]
async fn test_deleted_conversation_is_not_found() {
    let harness = Harness::new().await;
    persistence::delete_conversation(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap();
    let llm = MockLlmClient::new();
    let coordinator = harness.coordinator(llm.clone());

    let events: Vec<StreamEvent> = coordinator
        .query(harness.conversation_id, "how many users?", false)
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        StreamEvent::Error {
            kind: ErrorKind::NotFound,
            ..
        }
    ));
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn test_history_reaches_next_turn() {
    let harness = Harness::new().await;
    let llm = MockLlmClient::scripted([
        COUNT_USERS_REPLY,
        "There are 3 users.",
        "CLARIFY: Which users do you mean?",
    ]);
    let coordinator = harness.coordinator(llm.clone());

    let _: Vec<StreamEvent> = coordinator
        .query(harness.conversation_id, "how many users?", false)
        .collect()
        .await;
    let second: Vec<StreamEvent> = coordinator
        .query(harness.conversation_id, "and the old ones?", false)
        .collect()
        .await;

    assert!(matches!(
        second.as_slice(),
        [StreamEvent::FinalAnswer {
            needs_clarification: true,
            ..
        }]
    ));

    let request = &llm.requests()[2];
    let contents: Vec<&str> = request.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.contains(&"how many users?"));
    assert!(contents.contains(&"There are 3 users."));
    assert_eq!(contents.last(), Some(&"and the old ones?"));

    let messages = persistence::list_messages(harness.state.pool(), harness.conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 4);
}

#[tokio::test]
async fn test_concurrent_invocations_share_state_pool() {
    let harness = Harness::new().await;
    let other = harness.new_conversation().await;
    let coordinator = harness.coordinator(MockLlmClient::new());

    let (first, second) = tokio::join!(
        coordinator
            .query(harness.conversation_id, "how many users?", false)
            .collect::<Vec<_>>(),
        coordinator.query(other, "how many users?", false).collect::<Vec<_>>(),
    );

    for events in [&first, &second] {
        assert!(matches!(events.last(), Some(StreamEvent::FinalAnswer { .. })));
    }
    for conversation_id in [harness.conversation_id, other] {
        let messages = persistence::list_messages(harness.state.pool(), conversation_id)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
    }
}

#[tokio::test]
async fn test_commit_failure_ends_stream_with_storage_error() {
    let harness = Harness::new().await;
    let coordinator =
        harness.coordinator(MockLlmClient::scripted([COUNT_USERS_REPLY, "There are 3 users."]));

    let mut stream = coordinator.query(harness.conversation_id, "how many users?", false);
    assert!(matches!(stream.next().await, Some(StreamEvent::SqlProposed { .. })));
    assert!(matches!(stream.next().await, Some(StreamEvent::SqlResult { .. })));

    harness.state.close().await;
    let rest: Vec<StreamEvent> = stream.collect().await;

    assert_eq!(rest.len(), 2);
    assert!(matches!(rest[0], StreamEvent::FinalAnswer { .. }));
    assert!(matches!(
        rest[1],
        StreamEvent::Error {
            kind: ErrorKind::Storage,
            ..
        }
    ));

    let reopened = StateDb::open(&harness.state_path(), 1).await.unwrap();
    assert!(persistence::list_messages(reopened.pool(), harness.conversation_id)
        .await
        .unwrap()
        .is_empty());
    reopened.close().await;
}
