//! Core abstractions for the flow engine
//!
//! This crate provides the data model, the tool capability and the result
//! types that the runtime builds on. It does not schedule anything itself.

mod cache;
mod error;
pub mod events;
mod graph;
mod result;
mod stream;
mod tool;
mod value;

pub use cache::{CacheKey, CacheStore, CachedResult, InMemoryCache};
pub use error::{
    CacheError, FlowError, GraphError, LineError, NodeError, SinkError, StreamError, ToolError,
    ToolErrorKind,
};
pub use events::*;
pub use graph::{
    ActivateCondition, Binding, FlowGraph, FlowInput, FlowOutput, InputBinding, NodeSpec,
    RefSource, Reference, ValueType,
};
pub use result::{
    merge_metrics, BatchProgress, BatchResult, BatchStatus, BatchSummary, LineResult, LineStatus,
    NodeRun, NodeStatus, ResultSink, RunId,
};
pub use stream::{NodeOutput, ValueStream};
pub use tool::{FnTool, Tool, ToolOutput};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
