use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Graph validity errors. Always fatal: nothing runs once one is raised.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Node '{node}' references '{reference}' which does not resolve to a flow input or node")]
    UnresolvedReference { node: String, reference: String },

    #[error("Cyclic dependency detected between nodes: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Node name must not be empty")]
    EmptyNodeName,

    #[error("'{referrer}' references aggregation node '{aggregation}'")]
    InvalidAggregationReference { referrer: String, aggregation: String },

    #[error("Node '{node}' uses unknown tool '{tool}'")]
    UnknownTool { node: String, tool: String },

    #[error("Invalid reference expression: {0}")]
    InvalidReference(String),
}

/// How a failing tool wants its failure treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolErrorKind {
    /// Recorded on the node; the line keeps going.
    Recoverable,
    /// Stops the line; the row is eligible for retry.
    Transient,
    /// Stops the line; the row fails permanently.
    Fatal,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self { kind: ToolErrorKind::Recoverable, message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: ToolErrorKind::Transient, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: ToolErrorKind::Fatal, message: message.into() }
    }
}

/// Per-node failure detail recorded on a node run.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeError {
    #[error("Node '{node}' failed: {message}")]
    Execution {
        node: String,
        kind: ToolErrorKind,
        message: String,
    },

    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Node '{node}' was canceled")]
    Canceled { node: String },
}

impl NodeError {
    /// Whether this error stops the rest of the line from running.
    pub fn halts_line(&self) -> bool {
        matches!(
            self,
            NodeError::Execution { kind: ToolErrorKind::Transient | ToolErrorKind::Fatal, .. }
        )
    }
}

/// Line-level failure detail. Never propagated past the flow runner.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LineError {
    #[error("{0}")]
    NodeExecution(NodeError),

    #[error("Transient failure: {0}")]
    Transient(NodeError),

    #[error("Line {line} execution timeout after {timeout_ms}ms")]
    RowTimeout { line: usize, timeout_ms: u64 },

    #[error("Line {line} did not finish before the batch timeout of {timeout_ms}ms")]
    BatchTimeout { line: usize, timeout_ms: u64 },

    #[error("Missing flow input '{0}'")]
    MissingInput(String),

    #[error("Flow input '{name}' expects {expected}, got {actual}")]
    InputTypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Required output '{output}' is unavailable because node '{node}' did not complete")]
    RequiredOutput { output: String, node: String },

    #[error("Execution canceled")]
    Canceled,

    #[error("Line execution failed: {0}")]
    Execution(String),
}

impl LineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LineError::Transient(_))
    }
}

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Cache entry could not be encoded: {0}")]
    Encoding(String),
}

#[derive(Error, Debug, Clone)]
#[error("Result sink failed: {0}")]
pub struct SinkError(pub String);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Stream has already been consumed")]
    AlreadyConsumed,
}
