use crate::{NodeOutput, ToolError, Value, ValueStream};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;

/// Uniform invocation capability behind every node.
///
/// The engine does not care whether an implementation runs local code or
/// calls a remote service.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Invoke the tool with its resolved named inputs.
    async fn invoke(&self, inputs: &HashMap<String, Value>) -> Result<ToolOutput, ToolError>;

    /// Version folded into cache keys.
    fn version(&self) -> &str {
        "1"
    }
}

/// Result of a successful invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub output: NodeOutput,

    /// Numeric system metrics (token counts and the like), summed per line.
    pub metrics: HashMap<String, f64>,
}

impl ToolOutput {
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            output: NodeOutput::Value(value.into()),
            metrics: HashMap::new(),
        }
    }

    pub fn stream(stream: ValueStream) -> Self {
        Self {
            output: NodeOutput::Stream(stream),
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        ToolOutput::value(value)
    }
}

/// Adapts an async closure into a [`Tool`].
pub struct FnTool<F> {
    f: F,
    version: String,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(HashMap<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolOutput, ToolError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            version: "1".to_string(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(HashMap<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolOutput, ToolError>> + Send,
{
    async fn invoke(&self, inputs: &HashMap<String, Value>) -> Result<ToolOutput, ToolError> {
        (self.f)(inputs.clone()).await
    }

    fn version(&self) -> &str {
        &self.version
    }
}
