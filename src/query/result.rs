//! Result model of one executed statement and its transport form.

use crate::db::{QueryResult, Value};
use crate::error::ExecutionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Placeholder that replaces every row value of a secure result.
pub const MASKED_VALUE: &str = "********";

/// Columns and rows of one statement, linked to the step that produced it.
///
/// Every row has exactly one value per column; the constructors reject
/// anything else.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRunResult {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    for_chart: bool,
    linked_id: Uuid,
    secure: bool,
    truncated: bool,
    execution_time: Duration,
}

impl QueryRunResult {
    pub fn new(
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        linked_id: Uuid,
    ) -> Result<Self, ExecutionError> {
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(ExecutionError::unknown(format!(
                "Row {} has {} values but the result has {} columns",
                index,
                row.len(),
                columns.len()
            )));
        }

        Ok(Self {
            columns,
            rows,
            for_chart: false,
            linked_id,
            secure: false,
            truncated: false,
            execution_time: Duration::ZERO,
        })
    }

    /// Builds a run result from a raw driver result.
    pub fn from_query(result: QueryResult, linked_id: Uuid) -> Result<Self, ExecutionError> {
        let columns = result.column_names();
        let mut run = Self::new(columns, result.rows, linked_id)?;
        run.truncated = result.was_truncated;
        run.execution_time = result.execution_time;
        Ok(run)
    }

    pub fn with_for_chart(mut self, for_chart: bool) -> Self {
        self.for_chart = for_chart;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn for_chart(&self) -> bool {
        self.for_chart
    }

    pub fn linked_id(&self) -> Uuid {
        self.linked_id
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }
}

/// Wire form of a `QueryRunResult`, safe to leave the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub for_chart: bool,
    pub linked_id: Uuid,
    pub secure: bool,
    #[serde(default)]
    pub truncated: bool,
}

/// Converts a result to its transport form, masking every value when `secure`.
pub fn serialize(result: &QueryRunResult, secure: bool) -> TransportResult {
    let rows = result
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|value| {
                    if secure {
                        serde_json::Value::String(MASKED_VALUE.to_string())
                    } else {
                        value.to_json()
                    }
                })
                .collect()
        })
        .collect();

    TransportResult {
        columns: result.columns.clone(),
        rows,
        for_chart: result.for_chart,
        linked_id: result.linked_id,
        secure,
        truncated: result.truncated,
    }
}

/// Decides whether a result is offered as a chart.
pub trait ChartPolicy: Send + Sync {
    fn for_chart(&self, sql: &str, result: &QueryRunResult) -> bool;
}

/// Never marks results as chart-eligible.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverChart;

impl ChartPolicy for NeverChart {
    fn for_chart(&self, _sql: &str, _result: &QueryRunResult) -> bool {
        false
    }
}

/// Marks label/number pairs as chart-eligible.
///
/// Requires exactly two columns, at least two rows, and a numeric (or null)
/// second column in every row.
#[derive(Debug, Clone, Copy, Default)]
pub struct TwoColumnSeries;

impl ChartPolicy for TwoColumnSeries {
    fn for_chart(&self, _sql: &str, result: &QueryRunResult) -> bool {
        result.columns.len() == 2
            && result.rows.len() >= 2
            && result
                .rows
                .iter()
                .all(|row| row[1].is_numeric() || row[1].is_null())
    }
}

/// Configurable selection of a chart policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartPolicyKind {
    #[default]
    Never,
    TwoColumnSeries,
}

impl ChartPolicyKind {
    pub fn build(self) -> Box<dyn ChartPolicy> {
        match self {
            Self::Never => Box::new(NeverChart),
            Self::TwoColumnSeries => Box::new(TwoColumnSeries),
        }
    }
}
