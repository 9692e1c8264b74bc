//! Statement execution and the result model.
//!
//! This module isolates SQL execution and result shaping from the flow that
//! decides which statements to run.

pub mod executor;
pub mod result;

pub use executor::{ExecuteOptions, QueryExecutor, DEFAULT_ROW_LIMIT};
pub use result::{
    serialize, ChartPolicy, ChartPolicyKind, NeverChart, QueryRunResult, TransportResult,
    TwoColumnSeries, MASKED_VALUE,
};
