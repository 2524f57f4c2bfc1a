use crate::{BatchProgress, BatchStatus, BatchSummary, LineStatus, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted during flow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    BatchStarted {
        run_id: RunId,
        flow_name: String,
        total_lines: usize,
        timestamp: DateTime<Utc>,
    },
    BatchProgress {
        run_id: RunId,
        progress: BatchProgress,
        timestamp: DateTime<Utc>,
    },
    BatchCompleted {
        run_id: RunId,
        status: BatchStatus,
        summary: BatchSummary,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    LineStarted {
        run_id: RunId,
        line_number: usize,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    LineCompleted {
        run_id: RunId,
        line_number: usize,
        status: LineStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// Node events carry `line_number: None` for the aggregation pass.
    NodeStarted {
        run_id: RunId,
        line_number: Option<usize>,
        node: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        run_id: RunId,
        line_number: Option<usize>,
        node: String,
        cached: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        run_id: RunId,
        line_number: Option<usize>,
        node: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeBypassed {
        run_id: RunId,
        line_number: Option<usize>,
        node: String,
        timestamp: DateTime<Utc>,
    },
}

/// In-process broadcast of execution events
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Send to current subscribers; dropped silently when nobody listens.
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
