//! Command-line argument parsing for db-parley.
//!
//! `parley ask` and `parley run-sql` are the two query entry points; the
//! remaining subcommands manage the records they work on.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::Config;
use crate::query::DEFAULT_ROW_LIMIT;

/// Ask questions about any SQL database.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, value_name = "PATH", env = "PARLEY_CONFIG")]
    pub config: Option<PathBuf>,

    /// LLM provider to use (overrides config)
    #[arg(long, value_name = "PROVIDER")]
    pub llm: Option<String>,

    /// Also write logs to the state directory log file
    #[arg(long)]
    pub log_file: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage saved database connections
    #[command(subcommand)]
    Connection(ConnectionCommand),

    /// Manage conversations
    #[command(subcommand)]
    Conversation(ConversationCommand),

    /// Ask a question; prints one JSON event per line
    Ask(AskArgs),

    /// Run one statement against a conversation's database
    RunSql(RunSqlArgs),
}

#[derive(Subcommand, Debug)]
pub enum ConnectionCommand {
    /// Save a connection (postgres://… or sqlite:…)
    Add { name: String, dsn: String },
    /// List saved connections
    List,
    /// Remove a connection
    Remove { id: Uuid },
}

#[derive(Subcommand, Debug)]
pub enum ConversationCommand {
    /// Start a conversation on a connection
    New {
        connection_id: Uuid,
        #[arg(long, default_value = "New conversation")]
        name: String,
    },
    /// List conversations
    List {
        #[arg(long, value_name = "CONNECTION_ID")]
        connection: Option<Uuid>,
    },
    /// Print the messages of a conversation
    Show { id: Uuid },
    /// Rename a conversation
    Rename { id: Uuid, name: String },
    /// Delete a conversation
    Delete { id: Uuid },
}

#[derive(Args, Debug)]
pub struct AskArgs {
    pub conversation_id: Uuid,
    pub question: String,
    /// Mask every result value in output and storage
    #[arg(long)]
    pub secure: bool,
}

#[derive(Args, Debug)]
pub struct RunSqlArgs {
    pub conversation_id: Uuid,
    pub sql: String,
    /// Id to link the result to (random when omitted)
    #[arg(long, value_name = "UUID")]
    pub linked_id: Option<Uuid>,
    /// Maximum rows to return
    #[arg(long, default_value_t = DEFAULT_ROW_LIMIT)]
    pub limit: usize,
    /// Validate the statement without running it
    #[arg(long)]
    pub dry_run: bool,
    /// Mask every result value
    #[arg(long)]
    pub secure: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path (from CLI or default).
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }
}
