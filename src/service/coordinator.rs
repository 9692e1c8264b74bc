//! Streaming session coordinator.
//!
//! Each `query` call spawns one producer task. The producer owns the unit of
//! work and the sending half of a capacity-1 channel; the caller reads the
//! other half through `QueryStream`. The unit of work is committed only
//! after the flow finished and the consumer took the last event.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lookup::ConversationLookup;
use crate::config::FlowConfig;
use crate::db::{DatabaseClient, DatabaseConnector};
use crate::error::{ErrorKind, ParleyError, Result};
use crate::flow::{EventSink, FlowEngine, FlowModel, FlowRequest, FlowSummary, StreamEvent};
use crate::persistence::{StateDb, UnitOfWork};
use crate::query::{serialize, ExecuteOptions, QueryExecutor, TransportResult, DEFAULT_ROW_LIMIT};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    Committed { writes: usize },
    RolledBack { reason: ErrorKind },
}

/// A direct statement run outside the flow.
#[derive(Debug, Clone)]
pub struct RunSqlRequest {
    pub conversation_id: Uuid,
    pub sql: String,
    pub linked_id: Uuid,
    pub limit: usize,
    pub execute: bool,
    pub secure: bool,
}

impl RunSqlRequest {
    pub fn new(conversation_id: Uuid, sql: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sql: sql.into(),
            linked_id: Uuid::new_v4(),
            limit: DEFAULT_ROW_LIMIT,
            execute: true,
            secure: false,
        }
    }
}

/// Entry point for query invocations.
pub struct QueryCoordinator {
    state: Arc<StateDb>,
    lookup: Arc<dyn ConversationLookup>,
    connector: Arc<dyn DatabaseConnector>,
    model: Arc<dyn FlowModel>,
    engine: Arc<FlowEngine>,
    executor: QueryExecutor,
    settings: FlowConfig,
}

impl QueryCoordinator {
    pub fn new(
        state: Arc<StateDb>,
        lookup: Arc<dyn ConversationLookup>,
        connector: Arc<dyn DatabaseConnector>,
        model: Arc<dyn FlowModel>,
        settings: FlowConfig,
    ) -> Self {
        Self {
            state,
            lookup,
            connector,
            model,
            engine: Arc::new(FlowEngine::new(&settings)),
            executor: QueryExecutor::new(settings.allow_writes),
            settings,
        }
    }

    /// Starts answering `question` and returns the event stream.
    ///
    /// Must be called inside a Tokio runtime. Dropping the stream cancels
    /// the invocation and rolls its writes back.
    pub fn query(&self, conversation_id: Uuid, question: impl Into<String>, secure: bool) -> QueryStream {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let producer = Producer {
            state: Arc::clone(&self.state),
            lookup: Arc::clone(&self.lookup),
            connector: Arc::clone(&self.connector),
            model: Arc::clone(&self.model),
            engine: Arc::clone(&self.engine),
            row_limit: self.settings.row_limit,
            sink: ChannelSink {
                tx,
                cancel: cancel.clone(),
            },
        };

        let question = question.into();
        info!(conversation = %conversation_id, secure, "Query started");
        let handle = tokio::spawn(producer.run(conversation_id, question, secure));

        QueryStream {
            rx,
            handle,
            guard: cancel.drop_guard(),
        }
    }

    /// Runs one statement for a conversation's connection. Nothing is stored.
    pub async fn run_sql(&self, request: RunSqlRequest) -> Result<TransportResult> {
        let (_, connection) = self.lookup.resolve(request.conversation_id).await?;
        let client = self.connector.open(&connection.dsn).await?;

        let options = ExecuteOptions {
            limit: request.limit,
            execute: request.execute,
            secure: request.secure,
        };
        debug!(
            conversation = %request.conversation_id,
            limit = options.limit,
            execute = options.execute,
            "Running statement"
        );
        let outcome = self
            .executor
            .execute(client.as_ref(), &request.sql, request.linked_id, options)
            .await;
        client.close().await;

        let run = outcome
            .map_err(|e| if request.secure { e.redacted() } else { e })?
            .with_for_chart(false);
        Ok(serialize(&run, request.secure))
    }
}

/// Events of one invocation, single pass.
pub struct QueryStream {
    rx: mpsc::Receiver<StreamEvent>,
    handle: JoinHandle<InvocationOutcome>,
    guard: DropGuard,
}

impl QueryStream {
    /// Stops listening and returns the producer so the caller can await the
    /// rollback.
    pub fn disconnect(self) -> JoinHandle<InvocationOutcome> {
        let QueryStream { rx, handle, guard } = self;
        drop(guard);
        drop(rx);
        handle
    }
}

impl Stream for QueryStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl ChannelSink {
    /// Resolves once the consumer took every event sent so far.
    async fn drained(&self) -> Result<()> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(ParleyError::ConsumerDisconnected),
            permit = self.tx.reserve() => permit
                .map(drop)
                .map_err(|_| ParleyError::ConsumerDisconnected),
        }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: StreamEvent) -> Result<()> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(ParleyError::ConsumerDisconnected),
            sent = self.tx.send(event) => sent.map_err(|_| ParleyError::ConsumerDisconnected),
        }
    }
}

struct Producer {
    state: Arc<StateDb>,
    lookup: Arc<dyn ConversationLookup>,
    connector: Arc<dyn DatabaseConnector>,
    model: Arc<dyn FlowModel>,
    engine: Arc<FlowEngine>,
    row_limit: usize,
    sink: ChannelSink,
}

impl Producer {
    async fn run(mut self, conversation_id: Uuid, question: String, secure: bool) -> InvocationOutcome {
        let mut uow = self.state.begin();
        let cancel = self.sink.cancel.clone();

        let opened = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(ParleyError::ConsumerDisconnected),
            opened = self.open(conversation_id, question, secure) => opened,
        };

        let flow = match opened {
            Ok((request, client)) => {
                let flow = tokio::select! {
                    biased;

                    _ = cancel.cancelled() => Err(ParleyError::ConsumerDisconnected),
                    result = self.answer(client.as_ref(), request, &mut uow) => result,
                };
                client.close().await;
                flow
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &flow {
            if !matches!(e, ParleyError::ConsumerDisconnected) {
                if let Err(send_err) = self.sink.emit(StreamEvent::error(e)).await {
                    debug!("Could not deliver error event: {send_err}");
                }
            }
        }

        let flow = match flow {
            Ok(summary) => self.sink.drained().await.map(|_| summary),
            Err(e) => Err(e),
        };

        self.decide(conversation_id, flow, uow).await
    }

    /// Resolves the conversation and opens its database.
    async fn open(
        &self,
        conversation_id: Uuid,
        question: String,
        secure: bool,
    ) -> Result<(FlowRequest, Box<dyn DatabaseClient>)> {
        let (conversation, connection) = self.lookup.resolve(conversation_id).await?;
        let history = self.lookup.history(conversation.id).await?;
        let client = self.connector.open(&connection.dsn).await?;

        let request = FlowRequest {
            conversation_id: conversation.id,
            question,
            history,
            options: ExecuteOptions {
                limit: self.row_limit,
                execute: true,
                secure,
            },
        };
        Ok((request, client))
    }

    async fn answer(
        &mut self,
        client: &dyn DatabaseClient,
        request: FlowRequest,
        uow: &mut UnitOfWork,
    ) -> Result<FlowSummary> {
        self.engine
            .run(self.model.as_ref(), client, request, uow, &mut self.sink)
            .await
    }

    async fn decide(
        &mut self,
        conversation_id: Uuid,
        flow: Result<FlowSummary>,
        uow: UnitOfWork,
    ) -> InvocationOutcome {
        match flow {
            Ok(summary) => match uow.commit().await {
                Ok(writes) => {
                    info!(
                        conversation = %conversation_id,
                        steps = summary.steps,
                        writes,
                        "Query committed"
                    );
                    InvocationOutcome::Committed { writes }
                }
                Err(e) => {
                    error!(conversation = %conversation_id, "Commit failed: {e}");
                    let reason = e.kind();
                    if let Err(send_err) = self.sink.emit(StreamEvent::error(&e)).await {
                        debug!("Could not deliver commit failure: {send_err}");
                    }
                    InvocationOutcome::RolledBack { reason }
                }
            },
            Err(e) => {
                warn!(conversation = %conversation_id, kind = ?e.kind(), "Query rolled back: {e}");
                uow.rollback();
                InvocationOutcome::RolledBack { reason: e.kind() }
            }
        }
    }
}
