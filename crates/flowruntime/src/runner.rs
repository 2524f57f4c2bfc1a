use crate::context::ExecutionContext;
use crate::executor::{resolve_inputs, NodeExecutor, RunScope};
use crate::registry::NodeTools;
use crate::resolver::ExecutionPlan;
use chrono::Utc;
use flowcore::{
    merge_metrics, EventBus, ExecutionEvent, FlowGraph, LineError, LineResult, LineStatus,
    NodeError, NodeOutput, NodeRun, NodeSpec, NodeStatus, RefSource, RunId, ToolErrorKind, Value,
    ValueStream,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Identity and limits of one line execution attempt.
#[derive(Debug, Clone, Copy)]
pub struct LineRun {
    pub run_id: RunId,
    pub line_number: usize,
    pub attempt: u32,
    pub timeout: Option<Duration>,
}

/// Executes one full graph instance per call.
pub struct FlowRunner {
    graph: Arc<FlowGraph>,
    plan: Arc<ExecutionPlan>,
    tools: Arc<NodeTools>,
    executor: Arc<NodeExecutor>,
    events: Arc<EventBus>,
    node_concurrency: usize,
    /// Line nodes read by another line node; their streams get buffered.
    consumed: HashSet<String>,
}

impl FlowRunner {
    pub fn new(
        graph: Arc<FlowGraph>,
        plan: Arc<ExecutionPlan>,
        tools: Arc<NodeTools>,
        executor: Arc<NodeExecutor>,
        events: Arc<EventBus>,
        node_concurrency: usize,
    ) -> Self {
        let consumed = plan
            .line_order()
            .iter()
            .flat_map(|name| plan.upstream(name).iter().cloned())
            .collect();
        Self {
            graph,
            plan,
            tools,
            executor,
            events,
            node_concurrency: node_concurrency.max(1),
            consumed,
        }
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Run one line to a terminal status.
    ///
    /// Node and line failures are recorded on the result, never returned.
    pub async fn run_line(
        &self,
        line: LineRun,
        inputs: HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> LineResult {
        let start_time = Utc::now();
        let started = Instant::now();
        let scope = RunScope {
            run_id: line.run_id,
            line_number: Some(line.line_number),
        };

        self.events.emit(ExecutionEvent::LineStarted {
            run_id: line.run_id,
            line_number: line.line_number,
            attempt: line.attempt,
            timestamp: start_time,
        });
        tracing::debug!("Line {} attempt {} started", line.line_number, line.attempt);

        let (inputs, input_error) = match self.prepare_inputs(inputs) {
            Ok(inputs) => (inputs, None),
            Err((inputs, e)) => (inputs, Some(e)),
        };
        let mut ctx = ExecutionContext::new(line.line_number, inputs, self.plan.line_order());

        let (status, error) = match input_error {
            Some(e) => {
                ctx.cancel_unfinished();
                (LineStatus::Failed, Some(e))
            }
            None => self.drive(&mut ctx, scope, line, cancel).await,
        };

        let (outputs, output_error) = self.collect_outputs(&ctx);
        let (status, error) = match (status, error, output_error) {
            (LineStatus::Completed, None, Some(e)) => (LineStatus::Failed, Some(e)),
            (status, error, _) => (status, error),
        };

        let line_inputs = ctx.inputs().clone();
        let node_runs = ctx.into_node_runs();
        let mut system_metrics = HashMap::new();
        for run in node_runs.iter().filter(|r| r.status == NodeStatus::Completed) {
            merge_metrics(&mut system_metrics, &run.metrics);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &error {
            Some(e) => {
                tracing::info!("Line {} {:?} in {}ms: {}", line.line_number, status, duration_ms, e)
            }
            None => tracing::info!("Line {} {:?} in {}ms", line.line_number, status, duration_ms),
        }
        self.events.emit(ExecutionEvent::LineCompleted {
            run_id: line.run_id,
            line_number: line.line_number,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });

        LineResult {
            line_number: line.line_number,
            status,
            inputs: line_inputs,
            outputs,
            node_runs,
            error,
            attempts: line.attempt,
            system_metrics,
            start_time: Some(start_time),
            end_time: Some(Utc::now()),
            duration_ms,
        }
    }

    /// Schedule nodes until nothing is left to run.
    async fn drive(
        &self,
        ctx: &mut ExecutionContext,
        scope: RunScope,
        line: LineRun,
        cancel: &CancellationToken,
    ) -> (LineStatus, Option<LineError>) {
        let deadline = line.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut running = FuturesUnordered::new();
        let mut halt: Option<LineError> = None;
        let mut timed_out = false;

        loop {
            if halt.is_none() && !cancel.is_cancelled() {
                self.bypass_pending(ctx, scope);

                let capacity = self.node_concurrency.saturating_sub(running.len());
                for name in self.ready_nodes(ctx).into_iter().take(capacity) {
                    let Some(node) = self.graph.find_node(name) else {
                        continue;
                    };
                    let Some(tool) = self.tools.get(name).cloned() else {
                        continue;
                    };
                    let inputs = resolve_inputs(node, |r| ctx.lookup(r));
                    ctx.mark_running(name, inputs.clone());

                    let executor = &self.executor;
                    let buffer = self.consumed.contains(name);
                    let line_number = line.line_number;
                    running.push(async move {
                        let run = executor
                            .execute(scope, node, tool.as_ref(), inputs, cancel)
                            .await;
                        if buffer {
                            buffer_stream(line_number, run).await
                        } else {
                            run
                        }
                    });
                }
            }

            if running.is_empty() {
                break;
            }

            let next = match deadline {
                Some(deadline) => tokio::select! {
                    run = running.next() => run,
                    _ = tokio::time::sleep_until(deadline) => {
                        timed_out = true;
                        break;
                    }
                },
                None => running.next().await,
            };
            let Some(run) = next else {
                break;
            };

            if halt.is_none() {
                halt = run.error.as_ref().and_then(halting_error);
            }
            ctx.record(run);
        }

        // In-flight invocations are abandoned here, not interrupted.
        drop(running);

        if timed_out {
            let abandoned = ctx.cancel_unfinished();
            let timeout_ms = line.timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
            tracing::warn!(
                "Line {} execution timeout after {}ms, canceled {} unfinished nodes",
                line.line_number,
                timeout_ms,
                abandoned
            );
            return (
                LineStatus::Failed,
                Some(LineError::RowTimeout {
                    line: line.line_number,
                    timeout_ms,
                }),
            );
        }

        if let Some(error) = halt {
            ctx.cancel_unfinished();
            return (LineStatus::Failed, Some(error));
        }

        ctx.cancel_unfinished();
        if ctx.any_with_status(NodeStatus::Canceled) {
            return (LineStatus::Canceled, Some(LineError::Canceled));
        }
        (LineStatus::Completed, None)
    }

    /// Mark nodes bypassed until no more can be, since bypassing one node can
    /// make its dependents bypassable.
    fn bypass_pending(&self, ctx: &mut ExecutionContext, scope: RunScope) {
        loop {
            let bypassable: Vec<&str> = self
                .ready_nodes(ctx)
                .into_iter()
                .filter(|name| {
                    self.graph
                        .find_node(name)
                        .is_some_and(|node| self.should_bypass(ctx, node))
                })
                .collect();
            if bypassable.is_empty() {
                return;
            }
            for name in bypassable {
                tracing::debug!("Line {}: bypassing node '{}'", ctx.line_number(), name);
                ctx.mark_bypassed(name);
                self.events.emit(ExecutionEvent::NodeBypassed {
                    run_id: scope.run_id,
                    line_number: scope.line_number,
                    node: name.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn should_bypass(&self, ctx: &ExecutionContext, node: &NodeSpec) -> bool {
        let upstream = self.plan.upstream(&node.name);

        if let Some(activate) = &node.activate {
            if let Some(source) = activate.when.node_name() {
                if matches!(ctx.status(source), NodeStatus::Bypassed | NodeStatus::Failed) {
                    return true;
                }
            }
            let actual = ctx.lookup(&activate.when).unwrap_or(Value::Null);
            if actual.to_canonical_json() != activate.is.to_canonical_json() {
                return true;
            }
        }

        if node.bypass_on_upstream_failure
            && upstream.iter().any(|dep| ctx.status(dep) == NodeStatus::Failed)
        {
            return true;
        }

        !upstream.is_empty() && upstream.iter().all(|dep| ctx.status(dep) == NodeStatus::Bypassed)
    }

    fn upstream_settled(&self, ctx: &ExecutionContext, node: &str) -> bool {
        self.plan
            .upstream(node)
            .iter()
            .all(|dep| ctx.status(dep).is_settled())
    }

    /// Not yet started nodes whose upstream nodes have all settled, in plan
    /// order.
    fn ready_nodes(&self, ctx: &ExecutionContext) -> Vec<&str> {
        self.plan
            .line_order()
            .iter()
            .map(String::as_str)
            .filter(|name| ctx.status(name) == NodeStatus::NotStarted)
            .filter(|name| self.upstream_settled(ctx, name))
            .collect()
    }

    /// Fill in declared defaults and check declared types.
    ///
    /// On error the partially prepared inputs come back with it so the line
    /// result still records what was supplied.
    fn prepare_inputs(
        &self,
        mut inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, (HashMap<String, Value>, LineError)> {
        for declared in &self.graph.inputs {
            let value = match (inputs.get(&declared.name), &declared.default) {
                (Some(value), _) => value,
                (None, Some(default)) => {
                    inputs.insert(declared.name.clone(), default.clone());
                    continue;
                }
                (None, None) => {
                    let error = LineError::MissingInput(declared.name.clone());
                    return Err((inputs, error));
                }
            };
            if !declared.value_type.accepts(value) {
                let error = LineError::InputTypeMismatch {
                    name: declared.name.clone(),
                    expected: declared.value_type.name().to_string(),
                    actual: value.type_name().to_string(),
                };
                return Err((inputs, error));
            }
        }
        Ok(inputs)
    }

    /// Resolve flow outputs against the final context.
    ///
    /// Streams referenced as a whole are passed through without buffering.
    fn collect_outputs(
        &self,
        ctx: &ExecutionContext,
    ) -> (HashMap<String, Option<NodeOutput>>, Option<LineError>) {
        let mut outputs = HashMap::new();
        let mut error = None;

        for output in &self.graph.outputs {
            let value = match &output.reference.source {
                RefSource::Node(name) => {
                    let completed = ctx.status(name) == NodeStatus::Completed;
                    let passthrough = ctx
                        .run(name)
                        .filter(|_| completed && output.reference.path.is_empty())
                        .and_then(|run| run.output.clone());
                    if !completed && output.required {
                        error.get_or_insert(LineError::RequiredOutput {
                            output: output.name.clone(),
                            node: name.clone(),
                        });
                    }
                    passthrough.or_else(|| ctx.lookup(&output.reference).map(NodeOutput::Value))
                }
                RefSource::Inputs => ctx.lookup(&output.reference).map(NodeOutput::Value),
            };
            outputs.insert(output.name.clone(), value);
        }

        (outputs, error)
    }
}

/// Replace a one-shot stream output with a replayable buffered copy.
///
/// Runs inside the node's future so the row deadline also bounds it.
async fn buffer_stream(line_number: usize, mut run: NodeRun) -> NodeRun {
    if !matches!(&run.output, Some(NodeOutput::Stream(stream)) if !stream.is_restartable()) {
        return run;
    }
    let Some(output) = run.output.take() else {
        return run;
    };
    match output.materialize().await {
        Ok((_, replay)) => run.output = Some(replay),
        Err(e) => {
            tracing::warn!("Line {}: stream of '{}' unavailable: {}", line_number, run.node, e);
            run.output = Some(NodeOutput::Stream(ValueStream::replayable(Vec::new())));
        }
    }
    run
}

fn halting_error(error: &NodeError) -> Option<LineError> {
    match error {
        NodeError::Execution {
            kind: ToolErrorKind::Transient,
            ..
        } => Some(LineError::Transient(error.clone())),
        NodeError::Execution {
            kind: ToolErrorKind::Fatal,
            ..
        } => Some(LineError::NodeExecution(error.clone())),
        _ => None,
    }
}
