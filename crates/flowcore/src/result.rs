use crate::{LineError, NodeError, NodeOutput, SinkError, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Bypassed,
    Canceled,
}

impl NodeStatus {
    /// Statuses that unblock downstream nodes.
    pub fn is_settled(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Bypassed)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_settled() || *self == NodeStatus::Canceled
    }
}

/// Record of one node invocation within a line (or the aggregation pass).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRun {
    pub node: String,
    pub status: NodeStatus,
    pub inputs: HashMap<String, Value>,
    pub output: Option<NodeOutput>,
    pub error: Option<NodeError>,
    /// Output came from the cache store rather than an invocation.
    pub cached: bool,
    pub metrics: HashMap<String, f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl NodeRun {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            status: NodeStatus::NotStarted,
            inputs: HashMap::new(),
            output: None,
            error: None,
            cached: false,
            metrics: HashMap::new(),
            start_time: None,
            end_time: None,
            duration_ms: 0,
        }
    }

    pub fn output_value(&self) -> Option<&Value> {
        self.output.as_ref().and_then(NodeOutput::as_value)
    }

    fn clear_timing(&mut self) {
        self.start_time = None;
        self.end_time = None;
        self.duration_ms = 0;
        self.cached = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Snapshot of one line's execution context after it finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineResult {
    pub line_number: usize,
    pub status: LineStatus,
    pub inputs: HashMap<String, Value>,
    /// Flow outputs; `None` where the source node produced nothing.
    pub outputs: HashMap<String, Option<NodeOutput>>,
    /// Node runs in execution plan order.
    pub node_runs: Vec<NodeRun>,
    pub error: Option<LineError>,
    pub attempts: u32,
    pub system_metrics: HashMap<String, f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl LineResult {
    /// A line that never ran, e.g. because the batch was canceled first.
    pub fn not_run(
        line_number: usize,
        inputs: HashMap<String, Value>,
        status: LineStatus,
        error: LineError,
    ) -> Self {
        Self {
            line_number,
            status,
            inputs,
            outputs: HashMap::new(),
            node_runs: Vec::new(),
            error: Some(error),
            attempts: 0,
            system_metrics: HashMap::new(),
            start_time: None,
            end_time: None,
            duration_ms: 0,
        }
    }

    pub fn node_run(&self, name: &str) -> Option<&NodeRun> {
        self.node_runs.iter().find(|run| run.node == name)
    }

    pub fn output_value(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)?.as_ref()?.as_value()
    }

    pub fn is_success(&self) -> bool {
        self.status == LineStatus::Completed
    }

    /// Copy with every timestamp, duration and cache-hit flag cleared, for
    /// comparing runs.
    pub fn without_timing(&self) -> Self {
        let mut copy = self.clone();
        copy.start_time = None;
        copy.end_time = None;
        copy.duration_ms = 0;
        copy.node_runs.iter_mut().for_each(NodeRun::clear_timing);
        copy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Completed,
    /// Every row failed.
    Failed,
    Canceled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl BatchSummary {
    pub fn from_lines(lines: &[LineResult]) -> Self {
        let count = |status| lines.iter().filter(|line| line.status == status).count();
        Self {
            total: lines.len(),
            completed: count(LineStatus::Completed),
            failed: count(LineStatus::Failed),
            canceled: count(LineStatus::Canceled),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub run_id: RunId,
    pub flow_name: String,
    pub status: BatchStatus,
    /// One entry per input row, in input order.
    pub lines: Vec<LineResult>,
    pub summary: BatchSummary,
    pub aggregation_runs: Vec<NodeRun>,
    pub aggregation_outputs: HashMap<String, Option<NodeOutput>>,
    pub system_metrics: HashMap<String, f64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

impl BatchResult {
    pub fn status_table(&self) -> Vec<(usize, LineStatus)> {
        self.lines.iter().map(|line| (line.line_number, line.status)).collect()
    }

    /// Per-row error detail for every row that did not complete.
    pub fn errors(&self) -> Vec<(usize, &LineError)> {
        self.lines
            .iter()
            .filter_map(|line| line.error.as_ref().map(|e| (line.line_number, e)))
            .collect()
    }

    pub fn aggregation_value(&self, node: &str) -> Option<&Value> {
        self.aggregation_outputs.get(node)?.as_ref()?.as_value()
    }
}

/// Add every metric in `from` onto `into`.
pub fn merge_metrics(into: &mut HashMap<String, f64>, from: &HashMap<String, f64>) {
    for (name, value) in from {
        *into.entry(name.clone()).or_insert(0.0) += value;
    }
}

/// Persistence collaborator for finished results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist_line(&self, run_id: RunId, line: &LineResult) -> Result<(), SinkError>;

    async fn persist_batch(&self, batch: &BatchResult) -> Result<(), SinkError>;
}

/// Running totals of a batch, readable while it executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub running: usize,
    pub pending: usize,
    /// Mean wall time of finished lines.
    pub average_line_ms: Option<f64>,
    pub estimated_remaining_ms: Option<f64>,
}

impl BatchProgress {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.canceled
    }

    pub fn is_done(&self) -> bool {
        self.finished() == self.total
    }
}
