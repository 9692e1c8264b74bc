//! The generate→execute→observe loop.
//!
//! States: `Init -> Proposing -> (Executing -> Observing)* -> Finalizing -> Done`,
//! with `Failed` reachable from every state. Writes go to the caller's
//! `UnitOfWork`; whether they survive is the caller's decision.
//!
//! Events are emitted for what happened, not for every transition: a
//! proposal (plus its reasoning), its result or failure, and the final
//! answer. Entering `Proposing` emits nothing and is only logged at debug
//! level. A failure is reported by the caller as the terminal `Error`.

use std::fmt;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::FlowContext;
use super::events::{EventSink, StreamEvent};
use super::model::{FlowAction, FlowModel};
use crate::config::FlowConfig;
use crate::db::{DatabaseClient, Schema};
use crate::error::{FlowError, Result};
use crate::llm::{Message, Role};
use crate::persistence::UnitOfWork;
use crate::query::{serialize, ChartPolicy, ExecuteOptions, QueryExecutor, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Init,
    Proposing,
    Executing,
    Observing,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Proposing => "proposing",
            Self::Executing => "executing",
            Self::Observing => "observing",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One question to answer.
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub conversation_id: Uuid,
    pub question: String,
    /// Stored messages of the conversation, oldest first.
    pub history: Vec<Message>,
    pub options: ExecuteOptions,
}

/// Outcome of a flow that reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSummary {
    /// Model calls made.
    pub steps: usize,
    /// Statements that produced a result.
    pub executed: usize,
    /// Statements that failed and were observed.
    pub failed: usize,
    pub message_id: Uuid,
    pub needs_clarification: bool,
}

/// Runs one flow per call. Holds no per-invocation state.
pub struct FlowEngine {
    executor: QueryExecutor,
    chart_policy: Box<dyn ChartPolicy>,
    max_steps: usize,
    history_exchanges: usize,
}

impl FlowEngine {
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            executor: QueryExecutor::new(config.allow_writes),
            chart_policy: config.chart_policy.build(),
            max_steps: config.max_steps,
            history_exchanges: config.history_exchanges,
        }
    }

    pub fn with_chart_policy(mut self, policy: Box<dyn ChartPolicy>) -> Self {
        self.chart_policy = policy;
        self
    }

    /// Drives the loop to `Done` or `Failed`.
    ///
    /// On failure a system message describing it is buffered and the error is
    /// returned; the caller is expected to roll the unit of work back.
    pub async fn run(
        &self,
        model: &dyn FlowModel,
        client: &dyn DatabaseClient,
        request: FlowRequest,
        uow: &mut UnitOfWork,
        sink: &mut dyn EventSink,
    ) -> Result<FlowSummary> {
        let conversation_id = request.conversation_id;
        let mut state = FlowState::Init;

        match self
            .drive(model, client, request, uow, sink, &mut state)
            .await
        {
            Ok(summary) => {
                transition(&mut state, FlowState::Done);
                info!(
                    conversation = %conversation_id,
                    steps = summary.steps,
                    executed = summary.executed,
                    failed = summary.failed,
                    "Flow finished"
                );
                Ok(summary)
            }
            Err(e) => {
                let failed_in = state;
                transition(&mut state, FlowState::Failed);
                error!(conversation = %conversation_id, state = %failed_in, "Flow failed: {e}");
                uow.add_message(
                    conversation_id,
                    Role::System,
                    format!("Query failed during {failed_in}: {e}"),
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        model: &dyn FlowModel,
        client: &dyn DatabaseClient,
        request: FlowRequest,
        uow: &mut UnitOfWork,
        sink: &mut dyn EventSink,
        state: &mut FlowState,
    ) -> Result<FlowSummary> {
        let FlowRequest {
            conversation_id,
            question,
            history,
            options,
        } = request;

        let schema = match client.introspect_schema().await {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Schema introspection failed, continuing without schema: {e}");
                Schema::new()
            }
        };
        let mut context = FlowContext::new(
            client.backend(),
            schema,
            history,
            self.history_exchanges,
            &question,
            options.secure,
        );
        uow.add_message(conversation_id, Role::User, question.as_str());

        let mut results: Vec<(String, TransportResult)> = Vec::new();
        let mut steps = 0;
        let mut failed = 0;

        loop {
            transition(state, FlowState::Proposing);
            if steps >= self.max_steps {
                return Err(FlowError::StepLimitExceeded {
                    max_steps: self.max_steps,
                }
                .into());
            }
            steps += 1;

            let (text, needs_clarification) = match model.next_action(&context).await? {
                FlowAction::ProposeSql { sql, reasoning } => {
                    if let Some(text) = &reasoning {
                        sink.emit(StreamEvent::ReasoningStep {
                            step: steps,
                            text: text.clone(),
                        })
                        .await?;
                    }

                    let step_id = Uuid::new_v4();
                    sink.emit(StreamEvent::SqlProposed {
                        step_id,
                        step: steps,
                        sql: sql.clone(),
                    })
                    .await?;
                    context.record_proposal(reasoning.as_deref(), &sql);

                    transition(state, FlowState::Executing);
                    let outcome = self.executor.execute(client, &sql, step_id, options).await;

                    transition(state, FlowState::Observing);
                    match outcome {
                        Ok(run) => {
                            let for_chart = self.chart_policy.for_chart(&sql, &run);
                            let run = run.with_for_chart(for_chart);
                            let transport = serialize(&run, options.secure);
                            sink.emit(StreamEvent::SqlResult {
                                result: transport.clone(),
                            })
                            .await?;
                            context.observe_result(&run);
                            results.push((sql, transport));
                        }
                        Err(e) => {
                            debug!(step = steps, kind = %e.kind, "Statement failed; observing");
                            let e = if options.secure { e.redacted() } else { e };
                            failed += 1;
                            sink.emit(StreamEvent::SqlFailed {
                                step_id,
                                kind: e.kind,
                                message: e.message.clone(),
                            })
                            .await?;
                            context.observe_failure(&e);
                        }
                    }
                    continue;
                }
                FlowAction::AskClarification(text) => (text, true),
                FlowAction::FinalAnswer(text) => (text, false),
            };

            transition(state, FlowState::Finalizing);
            let executed = results.len();
            let message_id = uow.add_message(conversation_id, Role::Assistant, text.as_str());
            for (sql, result) in results {
                uow.add_result(message_id, sql, result);
            }

            sink.emit(StreamEvent::FinalAnswer {
                message_id,
                text,
                needs_clarification,
            })
            .await?;

            return Ok(FlowSummary {
                steps,
                executed,
                failed,
                message_id,
                needs_clarification,
            });
        }
    }
}

fn transition(state: &mut FlowState, next: FlowState) {
    if *state != next {
        debug!(from = %state, to = %next, "Flow transition");
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ColumnInfo, MockDatabaseClient, QueryResult, Value};
    use crate::error::{ExecutionError, ExecutionErrorKind, ParleyError};
    use crate::flow::LlmFlowModel;
    use crate::llm::MockLlmClient;
    use crate::persistence::{create_connection, create_conversation, list_messages, test_pool};
    use crate::query::{TwoColumnSeries, MASKED_VALUE};
    use pretty_assertions::assert_eq;
    use sqlx::sqlite::SqlitePool;

    const COUNT_SQL: &str = "```sql\nSELECT COUNT(*) AS count FROM users\n```";

    fn users_count() -> QueryResult {
        QueryResult::with_data(
            vec![ColumnInfo::new("count", "INTEGER")],
            vec![vec![Value::Int(3)]],
        )
    }

    fn users() -> QueryResult {
        QueryResult::with_data(
            vec![ColumnInfo::new("name", "TEXT"), ColumnInfo::new("email", "TEXT")],
            vec![vec![Value::from("Ada"), Value::from("ada@example.com")]],
        )
    }

    async fn setup() -> (SqlitePool, Uuid) {
        let pool = test_pool().await;
        let conn = create_connection(&pool, "local", "sqlite:x.db").await.unwrap();
        let conv = create_conversation(&pool, conn.id, "c").await.unwrap();
        (pool, conv.id)
    }

    fn request(conversation_id: Uuid, question: &str, secure: bool) -> FlowRequest {
        FlowRequest {
            conversation_id,
            question: question.to_string(),
            history: Vec::new(),
            options: ExecuteOptions {
                secure,
                ..ExecuteOptions::default()
            },
        }
    }

    fn engine(max_steps: usize) -> FlowEngine {
        FlowEngine::new(&FlowConfig {
            max_steps,
            ..FlowConfig::default()
        })
    }

    #[tokio::test]
    async fn test_users_count_scenario() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new().with_result("from users", users_count());
        let model = LlmFlowModel::new(Box::new(MockLlmClient::scripted([
            COUNT_SQL,
            "There are 3 users.",
        ])));

        let mut uow = UnitOfWork::new(pool.clone());
        let mut events: Vec<StreamEvent> = Vec::new();
        let summary = engine(5)
            .run(
                &model,
                &db,
                request(conversation_id, "How many users are there?", false),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
        let step_id = match &events[0] {
            StreamEvent::SqlProposed { step_id, step, sql } => {
                assert_eq!(*step, 1);
                assert_eq!(sql, "SELECT COUNT(*) AS count FROM users");
                *step_id
            }
            other => panic!("unexpected event {other:?}"),
        };
        match &events[1] {
            StreamEvent::SqlResult { result } => {
                assert_eq!(result.columns, vec!["count"]);
                assert_eq!(result.rows, vec![vec![serde_json::json!(3)]]);
                assert_eq!(result.linked_id, step_id);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            &events[2],
            StreamEvent::FinalAnswer { needs_clarification: false, text, .. } if text == "There are 3 users."
        ));
        assert_eq!(summary.steps, 2);
        assert_eq!(summary.executed, 1);

        uow.commit().await.unwrap();
        let messages = list_messages(&pool, conversation_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].id, summary.message_id);
        assert_eq!(messages[1].results.len(), 1);
        assert_eq!(messages[1].results[0].linked_id, step_id);
    }

    #[tokio::test]
    async fn test_step_limit_is_exact() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new().with_result("from users", users_count());
        let llm = MockLlmClient::scripted([COUNT_SQL, COUNT_SQL, COUNT_SQL, COUNT_SQL]);
        let model = LlmFlowModel::new(Box::new(llm.clone()));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        let err = engine(3)
            .run(
                &model,
                &db,
                request(conversation_id, "loop forever", false),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ParleyError::Flow(FlowError::StepLimitExceeded { max_steps: 3 })
        ));
        assert_eq!(llm.call_count(), 3);
        assert_eq!(db.executed().len(), 3);
        assert!(!events.iter().any(|e| e.is_terminal()));
        uow.rollback();
    }

    #[tokio::test]
    async fn test_failed_statement_is_observed() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new().with_result("from users", users_count());
        let llm = MockLlmClient::scripted(["```sql\nSELEC 1\n```", COUNT_SQL, "Three."]);
        let model = LlmFlowModel::new(Box::new(llm.clone()));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        let summary = engine(5)
            .run(
                &model,
                &db,
                request(conversation_id, "How many users?", false),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap();

        let types: Vec<&str> = events
            .iter()
            .map(|e| match e {
                StreamEvent::ReasoningStep { .. } => "reasoning",
                StreamEvent::SqlProposed { .. } => "proposed",
                StreamEvent::SqlResult { .. } => "result",
                StreamEvent::SqlFailed { .. } => "failed",
                StreamEvent::FinalAnswer { .. } => "final",
                StreamEvent::Error { .. } => "error",
            })
            .collect();
        assert_eq!(types, vec!["proposed", "failed", "proposed", "result", "final"]);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.executed, 1);

        let second_request = &llm.requests()[1];
        let observation = &second_request[second_request.len() - 1].content;
        assert!(observation.contains("syntax_error"));
    }

    #[tokio::test]
    async fn test_secure_masks_results_and_observations() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new().with_result("from users", users());
        let llm = MockLlmClient::scripted(["```sql\nSELECT name, email FROM users\n```", "One user."]);
        let model = LlmFlowModel::new(Box::new(llm.clone()));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        engine(5)
            .run(
                &model,
                &db,
                request(conversation_id, "Who?", true),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap();

        let StreamEvent::SqlResult { result } = &events[1] else {
            panic!("expected a result, got {:?}", events[1]);
        };
        assert!(result.secure);
        assert_eq!(result.columns, vec!["name", "email"]);
        assert_eq!(
            result.rows,
            vec![vec![serde_json::json!(MASKED_VALUE), serde_json::json!(MASKED_VALUE)]]
        );

        let requests = llm.requests();
        let observation = &requests[1].last().unwrap().content;
        assert!(observation.contains("name, email"));
        assert!(!observation.contains("Ada"));
        uow.rollback();
    }

    #[tokio::test]
    async fn test_secure_failure_hides_values() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new().with_error(
            "from users",
            ExecutionError::unknown(
                "invalid input syntax for type integer: \"Ada\"\n  DETAIL: Key (email)=(ada@example.com) already exists.",
            ),
        );
        let llm = MockLlmClient::scripted([
            "```sql\nSELECT CAST(name AS integer) FROM users\n```",
            "That column is not numeric.",
        ]);
        let model = LlmFlowModel::new(Box::new(llm.clone()));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        engine(5)
            .run(
                &model,
                &db,
                request(conversation_id, "Sum the names", true),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap();

        let StreamEvent::SqlFailed { kind, message, .. } = &events[1] else {
            panic!("expected a failure, got {:?}", events[1]);
        };
        assert_eq!(*kind, ExecutionErrorKind::Unknown);
        assert_eq!(message, "invalid input syntax for type integer: \"***\"");

        let requests = llm.requests();
        let observation = &requests[1].last().unwrap().content;
        assert!(observation.contains("invalid input syntax"));
        assert!(!observation.contains("Ada"));
        assert!(!observation.contains("ada@example.com"));
        uow.rollback();
    }

    #[tokio::test]
    async fn test_write_refused_without_allow_writes() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new();
        let model = LlmFlowModel::new(Box::new(MockLlmClient::scripted([
            "```sql\nDELETE FROM users\n```",
            "I am not allowed to delete.",
        ])));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        engine(5)
            .run(
                &model,
                &db,
                request(conversation_id, "Delete everyone", false),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap();

        assert!(matches!(
            events[1],
            StreamEvent::SqlFailed {
                kind: ExecutionErrorKind::PermissionDenied,
                ..
            }
        ));
        assert!(db.executed().is_empty());
        uow.rollback();
    }

    #[tokio::test]
    async fn test_clarification_finishes_turn() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new();
        let model = LlmFlowModel::new(Box::new(MockLlmClient::scripted(["CLARIFY: Which year?"])));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        let summary = engine(5)
            .run(
                &model,
                &db,
                request(conversation_id, "Sales?", false),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap();

        assert!(summary.needs_clarification);
        assert_eq!(
            events,
            vec![StreamEvent::FinalAnswer {
                message_id: summary.message_id,
                text: "Which year?".into(),
                needs_clarification: true,
            }]
        );
        uow.rollback();
    }

    #[tokio::test]
    async fn test_model_failure_buffers_system_message() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new();
        let model = LlmFlowModel::new(Box::new(
            MockLlmClient::scripted(Vec::<String>::new()).then_fail("connection reset"),
        ));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        let err = engine(5)
            .run(
                &model,
                &db,
                request(conversation_id, "Anything", false),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ParleyError::Flow(FlowError::ModelUnavailable(_))));
        assert!(events.is_empty());
        // The question and the failure note.
        assert_eq!(uow.pending_len(), 2);
        uow.rollback();
    }

    #[tokio::test]
    async fn test_reasoning_emitted_before_proposal() {
        let (pool, conversation_id) = setup().await;
        let db = MockDatabaseClient::new().with_result("from users", users_count());
        let model = LlmFlowModel::new(Box::new(MockLlmClient::scripted([
            "I will count the rows.\n```sql\nSELECT COUNT(*) AS count FROM users\n```",
            "Three.",
        ])));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        engine(5)
            .run(
                &model,
                &db,
                request(conversation_id, "How many users?", false),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap();

        assert_eq!(
            events[0],
            StreamEvent::ReasoningStep {
                step: 1,
                text: "I will count the rows.".into(),
            }
        );
        uow.rollback();
    }

    #[tokio::test]
    async fn test_chart_policy_marks_results() {
        let (pool, conversation_id) = setup().await;
        let series = QueryResult::with_data(
            vec![ColumnInfo::new("region", "TEXT"), ColumnInfo::new("total", "INTEGER")],
            vec![
                vec![Value::from("north"), Value::Int(4)],
                vec![Value::from("south"), Value::Int(7)],
            ],
        );
        let db = MockDatabaseClient::new().with_result("from sales", series);
        let model = LlmFlowModel::new(Box::new(MockLlmClient::scripted([
            "```sql\nSELECT region, total FROM sales\n```",
            "North sold less.",
        ])));

        let mut uow = UnitOfWork::new(pool);
        let mut events: Vec<StreamEvent> = Vec::new();
        engine(5)
            .with_chart_policy(Box::new(TwoColumnSeries))
            .run(
                &model,
                &db,
                request(conversation_id, "Sales by region", false),
                &mut uow,
                &mut events,
            )
            .await
            .unwrap();

        assert!(matches!(&events[1], StreamEvent::SqlResult { result } if result.for_chart));
        uow.rollback();
    }
}
