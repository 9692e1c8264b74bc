//! db-parley - ask questions about any SQL database.

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use db_parley::cli::{Cli, Command, ConnectionCommand, ConversationCommand};
use db_parley::config::Config;
use db_parley::db::DsnConnector;
use db_parley::error::ParleyError;
use db_parley::flow::{LlmFlowModel, StreamEvent};
use db_parley::llm::create_client;
use db_parley::logging;
use db_parley::persistence::{self, StateDb};
use db_parley::service::{QueryCoordinator, RunSqlRequest, StateLookup};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    if cli.log_file {
        logging::init_logging_with_file();
    } else {
        logging::init_stderr_logging();
    }

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<ParleyError>() {
            Some(parley) => error!("{}: {}", parley.category(), parley),
            None => error!("{e:#}"),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load_from_file(&config_path)?;
    config.apply_env_overrides();
    if let Some(provider) = &cli.llm {
        config.llm.provider = provider.clone();
    }

    let state_path = config.state_path()?;
    let state = StateDb::open(&state_path, config.state.max_connections)
        .await
        .with_context(|| format!("opening state database {}", state_path.display()))?;

    let result = dispatch(cli.command, &config, &state).await;
    state.close().await;
    result
}

async fn dispatch(command: Command, config: &Config, state: &StateDb) -> anyhow::Result<()> {
    let pool = state.pool();

    match command {
        Command::Connection(ConnectionCommand::Add { name, dsn }) => {
            print_json(&persistence::create_connection(pool, &name, &dsn).await?)
        }
        Command::Connection(ConnectionCommand::List) => {
            for connection in persistence::list_connections(pool).await? {
                print_json(&connection)?;
            }
            Ok(())
        }
        Command::Connection(ConnectionCommand::Remove { id }) => {
            if !persistence::delete_connection(pool, id).await? {
                return Err(ParleyError::not_found(format!("connection {id}")).into());
            }
            Ok(())
        }
        Command::Conversation(ConversationCommand::New {
            connection_id,
            name,
        }) => print_json(&persistence::create_conversation(pool, connection_id, &name).await?),
        Command::Conversation(ConversationCommand::List { connection }) => {
            for conversation in persistence::list_conversations(pool, connection).await? {
                print_json(&conversation)?;
            }
            Ok(())
        }
        Command::Conversation(ConversationCommand::Show { id }) => {
            if persistence::get_conversation(pool, id).await?.is_none() {
                return Err(ParleyError::not_found(format!("conversation {id}")).into());
            }
            for message in persistence::list_messages(pool, id).await? {
                print_json(&message)?;
            }
            Ok(())
        }
        Command::Conversation(ConversationCommand::Rename { id, name }) => {
            Ok(persistence::rename_conversation(pool, id, &name).await?)
        }
        Command::Conversation(ConversationCommand::Delete { id }) => {
            if !persistence::delete_conversation(pool, id).await? {
                return Err(ParleyError::not_found(format!("conversation {id}")).into());
            }
            Ok(())
        }
        Command::Ask(args) => {
            let coordinator = build_coordinator(config, state)?;
            let mut stream = coordinator.query(args.conversation_id, args.question, args.secure);

            let mut failed = false;
            while let Some(event) = stream.next().await {
                failed |= matches!(event, StreamEvent::Error { .. });
                print_json(&event)?;
            }
            if failed {
                anyhow::bail!("query did not complete");
            }
            Ok(())
        }
        Command::RunSql(args) => {
            let coordinator = build_coordinator(config, state)?;
            let request = RunSqlRequest {
                conversation_id: args.conversation_id,
                sql: args.sql,
                linked_id: args.linked_id.unwrap_or_else(Uuid::new_v4),
                limit: args.limit,
                execute: !args.dry_run,
                secure: args.secure,
            };
            print_json(&coordinator.run_sql(request).await?)
        }
    }
}

fn build_coordinator(config: &Config, state: &StateDb) -> anyhow::Result<QueryCoordinator> {
    let client = create_client(&config.llm)?;
    let state = Arc::new(state.clone());

    Ok(QueryCoordinator::new(
        Arc::clone(&state),
        Arc::new(StateLookup::new(state.as_ref().clone())),
        Arc::new(DsnConnector::new(config.database.clone())),
        Arc::new(LlmFlowModel::new(client)),
        config.flow.clone(),
    ))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
