//! Query invocation services.
//!
//! `QueryCoordinator` ties lookup, the external database, the flow and the
//! unit of work together for one invocation at a time.

pub mod coordinator;
pub mod lookup;

pub use coordinator::{InvocationOutcome, QueryCoordinator, QueryStream, RunSqlRequest};
pub use lookup::{ConversationLookup, StateLookup};
