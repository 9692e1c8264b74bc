//! db-parley - ask questions about any SQL database.
//!
//! A question becomes one or more SQL statements run against an external
//! database. Every step is streamed back as it happens, and the turn is
//! stored only when the whole stream completed.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod flow;
pub mod llm;
pub mod logging;
pub mod persistence;
pub mod query;
pub mod safety;
pub mod service;
