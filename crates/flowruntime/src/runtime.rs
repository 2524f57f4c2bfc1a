use crate::aggregation::AggregationRunner;
use crate::batch::{BatchOptions, BatchScheduler, ProgressTracker};
use crate::executor::NodeExecutor;
use crate::registry::ToolRegistry;
use crate::resolver::{DependencyResolver, ExecutionPlan};
use crate::runner::{FlowRunner, LineRun};
use flowcore::{
    BatchProgress, BatchResult, CacheStore, EventBus, ExecutionEvent, FlowError, FlowGraph,
    LineResult, NodeOutput, NodeRun, ResultSink, RunId, Tool, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Main entry point for validating and running flows
pub struct FlowRuntime {
    registry: ToolRegistry,
    event_bus: Arc<EventBus>,
    cache: Option<Arc<dyn CacheStore>>,
    sink: Option<Arc<dyn ResultSink>>,
    config: RuntimeConfig,
}

/// Runners wired up for one validated graph.
struct PreparedFlow {
    runner: Arc<FlowRunner>,
    aggregation: AggregationRunner,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(ToolRegistry::new(), config)
    }

    /// Create a new runtime with a pre-populated registry
    pub fn with_registry(registry: ToolRegistry, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            registry,
            event_bus,
            cache: None,
            sink: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn register_tool(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) {
        self.registry.register(name, tool);
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Check the graph and its tools without running anything.
    pub fn validate(&self, graph: &FlowGraph) -> Result<ExecutionPlan, FlowError> {
        let plan = DependencyResolver::resolve(graph)?;
        self.registry.resolve(graph)?;
        Ok(plan)
    }

    /// Run a single line, then the aggregation pass over that line alone.
    pub async fn test(
        &self,
        graph: FlowGraph,
        inputs: HashMap<String, Value>,
    ) -> Result<TestResult, FlowError> {
        let prepared = self.prepare(graph)?;
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        tracing::info!("Testing flow '{}' (run {})", prepared.runner.graph().name, run_id);

        let line = LineRun {
            run_id,
            line_number: 0,
            attempt: 1,
            timeout: None,
        };
        let result = prepared.runner.run_line(line, inputs, &cancel).await;

        let mut lines = vec![result];
        let (aggregation_runs, aggregation_outputs) =
            prepared.aggregation.run(run_id, &mut lines, &cancel).await;
        let line = lines.pop().ok_or_else(|| FlowError::Execution("test line missing".into()))?;

        Ok(TestResult {
            run_id,
            line,
            aggregation_runs,
            aggregation_outputs,
        })
    }

    /// Validate the graph and start the batch in the background.
    ///
    /// Graph errors are returned here, before any row runs.
    pub fn submit_batch(
        &self,
        graph: FlowGraph,
        rows: Vec<HashMap<String, Value>>,
        options: BatchOptions,
    ) -> Result<BatchHandle, FlowError> {
        let prepared = self.prepare(graph)?;
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let progress = Arc::new(ProgressTracker::new(rows.len(), options.concurrency));

        let scheduler = BatchScheduler::new(
            prepared.runner,
            prepared.aggregation,
            self.event_bus.clone(),
            options,
        )
        .with_sink(self.sink.clone());

        let task = tokio::spawn({
            let progress = progress.clone();
            let cancel = cancel.clone();
            async move { scheduler.run(run_id, rows, progress, cancel).await }
        });

        Ok(BatchHandle {
            run_id,
            progress,
            cancel,
            task,
        })
    }

    /// Run a batch to completion.
    pub async fn run_batch(
        &self,
        graph: FlowGraph,
        rows: Vec<HashMap<String, Value>>,
        options: BatchOptions,
    ) -> Result<BatchResult, FlowError> {
        self.submit_batch(graph, rows, options)?.wait().await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn prepare(&self, graph: FlowGraph) -> Result<PreparedFlow, FlowError> {
        let plan = Arc::new(DependencyResolver::resolve(&graph)?);
        let tools = Arc::new(self.registry.resolve(&graph)?);
        let graph = Arc::new(graph);

        let mut executor = NodeExecutor::new(self.event_bus.clone()).with_default_timeout(
            self.config.default_node_timeout_ms.map(Duration::from_millis),
        );
        if let Some(cache) = &self.cache {
            executor = executor.with_cache(cache.clone());
        }
        let executor = Arc::new(executor);

        let runner = FlowRunner::new(
            graph.clone(),
            plan.clone(),
            tools.clone(),
            executor.clone(),
            self.event_bus.clone(),
            self.config.node_concurrency,
        );
        let aggregation = AggregationRunner::new(graph, plan, tools, executor, self.event_bus.clone());
        Ok(PreparedFlow {
            runner: Arc::new(runner),
            aggregation,
        })
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Independent nodes of one line running at the same time.
    pub node_concurrency: usize,
    /// Applies to nodes without their own timeout.
    pub default_node_timeout_ms: Option<u64>,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_concurrency: 16,
            default_node_timeout_ms: None,
            event_buffer_size: 1000,
        }
    }
}

/// Outcome of [`FlowRuntime::test`].
#[derive(Debug, Clone)]
pub struct TestResult {
    pub run_id: RunId,
    pub line: LineResult,
    pub aggregation_runs: Vec<NodeRun>,
    pub aggregation_outputs: HashMap<String, Option<NodeOutput>>,
}

/// Handle to a batch running in the background
pub struct BatchHandle {
    run_id: RunId,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    task: JoinHandle<BatchResult>,
}

impl BatchHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn progress(&self) -> BatchProgress {
        self.progress.snapshot()
    }

    /// Stop dispatching rows. Running rows finish cooperatively.
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested for batch {}", self.run_id);
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<BatchResult, FlowError> {
        self.task
            .await
            .map_err(|e| FlowError::Execution(format!("batch {} did not finish: {}", self.run_id, e)))
    }
}
