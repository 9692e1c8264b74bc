//! Multi-step query flow.
//!
//! The engine asks a `FlowModel` what to do, runs proposed statements
//! through the executor, feeds the outcome back and streams every step to an
//! `EventSink`.

pub mod context;
pub mod engine;
pub mod events;
pub mod model;

pub use context::FlowContext;
pub use engine::{FlowEngine, FlowRequest, FlowState, FlowSummary};
pub use events::{EventSink, StreamEvent};
pub use model::{FlowAction, FlowModel, LlmFlowModel};
