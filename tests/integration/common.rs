//! Shared fixtures: a state database, a seeded external SQLite database and
//! a conversation pointing at it.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use db_parley::config::{DatabaseConfig, FlowConfig};
use db_parley::db::DsnConnector;
use db_parley::flow::LlmFlowModel;
use db_parley::llm::MockLlmClient;
use db_parley::persistence::{self, StateDb};
use db_parley::service::{QueryCoordinator, StateLookup};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use tempfile::TempDir;
use uuid::Uuid;

const STATE_FILE: &str = "state.db";

pub struct Harness {
    pub _dir: TempDir,
    pub state: Arc<StateDb>,
    pub connection_id: Uuid,
    pub conversation_id: Uuid,
    pub external_path: PathBuf,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let external_path = dir.path().join("external.db");
        seed_external(&external_path).await;

        let state = Arc::new(
            StateDb::open(&dir.path().join(STATE_FILE), 4)
                .await
                .unwrap(),
        );
        let dsn = format!("sqlite:{}", external_path.display());
        let connection = persistence::create_connection(state.pool(), "external", &dsn)
            .await
            .unwrap();
        let conversation = persistence::create_conversation(state.pool(), connection.id, "test")
            .await
            .unwrap();

        Self {
            _dir: dir,
            state,
            connection_id: connection.id,
            conversation_id: conversation.id,
            external_path,
        }
    }

    /// Another conversation on the same connection.
    pub async fn new_conversation(&self) -> Uuid {
        persistence::create_conversation(self.state.pool(), self.connection_id, "other")
            .await
            .unwrap()
            .id
    }

    pub fn coordinator(&self, llm: MockLlmClient) -> QueryCoordinator {
        self.coordinator_with(llm, FlowConfig::default())
    }

    pub fn coordinator_with(&self, llm: MockLlmClient, flow: FlowConfig) -> QueryCoordinator {
        QueryCoordinator::new(
            Arc::clone(&self.state),
            Arc::new(StateLookup::new(self.state.as_ref().clone())),
            Arc::new(DsnConnector::new(DatabaseConfig::default())),
            Arc::new(LlmFlowModel::new(Box::new(llm))),
            flow,
        )
    }

    pub fn state_path(&self) -> PathBuf {
        self._dir.path().join(STATE_FILE)
    }

    pub async fn people_count(&self) -> i64 {
        let mut conn = self.external().await;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM people")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();
        count
    }

    async fn external(&self) -> sqlx::SqliteConnection {
        SqliteConnectOptions::from_str(&format!("sqlite:{}", self.external_path.display()))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }
}

/// `users(id, name)` with 3 rows and `people` with 5 columns and 5 rows.
async fn seed_external(path: &Path) {
    let mut conn = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();

    let statements = [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        "INSERT INTO users (id, name) VALUES (1, 'Ada'), (2, 'Grace'), (3, 'Linus')",
        "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, email TEXT, age INTEGER, city TEXT)",
        "INSERT INTO people VALUES \
            (1, 'Ada', 'ada@example.com', 36, 'London'), \
            (2, 'Grace', 'grace@example.com', 45, 'New York'), \
            (3, 'Linus', 'linus@example.com', 28, 'Helsinki'), \
            (4, 'Barbara', 'barbara@example.com', 52, 'Boston'), \
            (5, 'Dennis', 'dennis@example.com', 41, 'Murray Hill')",
    ];
    for sql in statements {
        sqlx::query(sql).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();
}

pub const COUNT_USERS_REPLY: &str = "```sql\nSELECT COUNT(*) AS count FROM users\n```";
