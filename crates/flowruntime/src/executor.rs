use chrono::Utc;
use flowcore::{
    Binding, CacheKey, CacheStore, CachedResult, EventBus, ExecutionEvent, NodeError, NodeOutput,
    NodeRun, NodeSpec, NodeStatus, Reference, RunId, Tool, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Where a node run happens; `line_number` is `None` in the aggregation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunScope {
    pub run_id: RunId,
    pub line_number: Option<usize>,
}

/// Substitute every binding of `node`: literals pass through, references go
/// through `lookup`. Unavailable references become `Null`.
pub fn resolve_inputs(
    node: &NodeSpec,
    mut lookup: impl FnMut(&Reference) -> Option<Value>,
) -> HashMap<String, Value> {
    node.inputs
        .iter()
        .map(|input| {
            let value = match &input.binding {
                Binding::Literal(value) => value.clone(),
                Binding::Reference(reference) => lookup(reference).unwrap_or(Value::Null),
            };
            (input.name.clone(), value)
        })
        .collect()
}

/// Runs single nodes: cache lookup, bounded invocation, result capture.
pub struct NodeExecutor {
    cache: Option<Arc<dyn CacheStore>>,
    events: Arc<EventBus>,
    default_timeout: Option<Duration>,
}

impl NodeExecutor {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            cache: None,
            events,
            default_timeout: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// A per-node timeout wins over the executor default.
    pub fn timeout_for(&self, node: &NodeSpec) -> Option<Duration> {
        node.timeout_ms.map(Duration::from_millis).or(self.default_timeout)
    }

    /// Execute `node` with already-resolved inputs.
    ///
    /// Never returns an error: every outcome is recorded on the returned run.
    /// Cancellation is observed only once the invocation returns; the tool is
    /// never interrupted, its result is discarded.
    pub async fn execute(
        &self,
        scope: RunScope,
        node: &NodeSpec,
        tool: &dyn Tool,
        inputs: HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> NodeRun {
        let mut run = NodeRun::new(node.name.clone());
        run.inputs = inputs;
        run.status = NodeStatus::Running;
        run.start_time = Some(Utc::now());
        let started = Instant::now();

        self.events.emit(ExecutionEvent::NodeStarted {
            run_id: scope.run_id,
            line_number: scope.line_number,
            node: node.name.clone(),
            timestamp: Utc::now(),
        });

        let cache_key = self.cache_key(node, tool, &run.inputs);
        if let Some(hit) = self.cached_result(cache_key.as_ref()).await {
            tracing::debug!("Node '{}' served from cache", node.name);
            run.output = Some(NodeOutput::Value(hit.value));
            run.metrics = hit.metrics;
            run.cached = true;
            run.status = NodeStatus::Completed;
            return self.finish(scope, run, started);
        }

        let invocation = tool.invoke(&run.inputs);
        let outcome = match self.timeout_for(node) {
            Some(limit) => timeout(limit, invocation).await.map_err(|_| limit),
            None => Ok(invocation.await),
        };

        if cancel.is_cancelled() {
            tracing::debug!("Node '{}' finished after cancellation; discarding result", node.name);
            run.status = NodeStatus::Canceled;
            run.error = Some(NodeError::Canceled { node: node.name.clone() });
            return self.finish(scope, run, started);
        }

        match outcome {
            Ok(Ok(output)) => {
                if let (Some(key), NodeOutput::Value(value)) = (&cache_key, &output.output) {
                    let entry = CachedResult::new(value.clone(), output.metrics.clone());
                    self.store(key, entry).await;
                }
                run.output = Some(output.output);
                run.metrics = output.metrics;
                run.status = NodeStatus::Completed;
            }
            Ok(Err(e)) => {
                run.status = NodeStatus::Failed;
                run.error = Some(NodeError::Execution {
                    node: node.name.clone(),
                    kind: e.kind,
                    message: e.message,
                });
            }
            Err(limit) => {
                tracing::warn!("Node '{}' timed out after {:?}", node.name, limit);
                run.status = NodeStatus::Failed;
                run.error = Some(NodeError::Timeout {
                    node: node.name.clone(),
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        }

        self.finish(scope, run, started)
    }

    fn cache_key(
        &self,
        node: &NodeSpec,
        tool: &dyn Tool,
        inputs: &HashMap<String, Value>,
    ) -> Option<CacheKey> {
        if !node.cache || self.cache.is_none() {
            return None;
        }
        match CacheKey::compute(&node.name, tool.version(), inputs) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("Node '{}' is not cacheable: {}", node.name, e);
                None
            }
        }
    }

    async fn cached_result(&self, key: Option<&CacheKey>) -> Option<CachedResult> {
        let (cache, key) = (self.cache.as_ref()?, key?);
        match cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!("Cache lookup for {} failed, recomputing: {}", key, e);
                None
            }
        }
    }

    async fn store(&self, key: &CacheKey, entry: CachedResult) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(key, entry).await {
                tracing::warn!("Cache write for {} failed: {}", key, e);
            }
        }
    }

    fn finish(&self, scope: RunScope, mut run: NodeRun, started: Instant) -> NodeRun {
        run.end_time = Some(Utc::now());
        run.duration_ms = started.elapsed().as_millis() as u64;

        let event = match (&run.status, &run.error) {
            (NodeStatus::Completed, _) => {
                tracing::debug!("Node '{}' completed in {}ms", run.node, run.duration_ms);
                ExecutionEvent::NodeCompleted {
                    run_id: scope.run_id,
                    line_number: scope.line_number,
                    node: run.node.clone(),
                    cached: run.cached,
                    duration_ms: run.duration_ms,
                    timestamp: Utc::now(),
                }
            }
            (_, error) => {
                let message = error.as_ref().map(ToString::to_string).unwrap_or_default();
                if run.error.as_ref().is_some_and(NodeError::halts_line) {
                    tracing::error!("{}", message);
                } else {
                    tracing::debug!("{}", message);
                }
                ExecutionEvent::NodeFailed {
                    run_id: scope.run_id,
                    line_number: scope.line_number,
                    node: run.node.clone(),
                    error: message,
                    timestamp: Utc::now(),
                }
            }
        };
        self.events.emit(event);
        run
    }
}
