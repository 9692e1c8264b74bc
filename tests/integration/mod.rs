//! Integration tests for db-parley.

pub mod common;
pub mod persistence_test;
pub mod postgres_test;
pub mod query_test;
pub mod streaming_test;
