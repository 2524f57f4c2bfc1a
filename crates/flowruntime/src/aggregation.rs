use crate::executor::{resolve_inputs, NodeExecutor, RunScope};
use crate::registry::NodeTools;
use crate::resolver::ExecutionPlan;
use chrono::Utc;
use flowcore::{
    EventBus, ExecutionEvent, FlowGraph, LineResult, NodeError, NodeOutput, NodeRun, NodeStatus,
    RefSource, Reference, RunId, Value, ValueStream,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs the aggregation post-pass once over all collected lines.
pub struct AggregationRunner {
    graph: Arc<FlowGraph>,
    plan: Arc<ExecutionPlan>,
    tools: Arc<NodeTools>,
    executor: Arc<NodeExecutor>,
    events: Arc<EventBus>,
}

/// Aggregation node runs plus their outputs keyed by node name.
pub type AggregationOutcome = (Vec<NodeRun>, HashMap<String, Option<NodeOutput>>);

impl AggregationRunner {
    pub fn new(
        graph: Arc<FlowGraph>,
        plan: Arc<ExecutionPlan>,
        tools: Arc<NodeTools>,
        executor: Arc<NodeExecutor>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            graph,
            plan,
            tools,
            executor,
            events,
        }
    }

    /// Run every aggregation node sequentially in plan order.
    ///
    /// A reference to a line node or flow input resolves to the array of
    /// per-line values in line order, `Null` where a line has none.
    /// References between aggregation nodes resolve to the plain output.
    pub async fn run(
        &self,
        run_id: RunId,
        lines: &mut [LineResult],
        cancel: &CancellationToken,
    ) -> AggregationOutcome {
        let mut runs: Vec<NodeRun> = Vec::new();
        let mut outputs = HashMap::new();
        if self.plan.aggregation_order().is_empty() {
            return (runs, outputs);
        }

        tracing::info!(
            "Running {} aggregation nodes over {} lines",
            self.plan.aggregation_order().len(),
            lines.len()
        );
        let scope = RunScope {
            run_id,
            line_number: None,
        };

        for name in self.plan.aggregation_order() {
            let (Some(node), Some(tool)) = (self.graph.find_node(name), self.tools.get(name)) else {
                continue;
            };

            for upstream in node.upstream_nodes() {
                if !self.is_aggregation(upstream) {
                    materialize_line_streams(lines, upstream).await;
                }
            }

            let lookup = |reference: &Reference| self.aggregate(reference, lines, &runs);

            let skip = node.activate.as_ref().is_some_and(|activate| {
                let actual = lookup(&activate.when).unwrap_or(Value::Null);
                actual.to_canonical_json() != activate.is.to_canonical_json()
            }) || (node.bypass_on_upstream_failure
                && node.upstream_nodes().iter().any(|dep| {
                    runs.iter()
                        .any(|run| run.node == *dep && run.status == NodeStatus::Failed)
                }));

            if skip || cancel.is_cancelled() {
                let mut run = NodeRun::new(name.clone());
                if skip {
                    let now = Utc::now();
                    run.status = NodeStatus::Bypassed;
                    run.start_time = Some(now);
                    run.end_time = Some(now);
                    self.events.emit(ExecutionEvent::NodeBypassed {
                        run_id,
                        line_number: None,
                        node: name.clone(),
                        timestamp: now,
                    });
                } else {
                    run.status = NodeStatus::Canceled;
                    run.error = Some(NodeError::Canceled { node: name.clone() });
                }
                outputs.insert(name.clone(), None);
                runs.push(run);
                continue;
            }

            let inputs = resolve_inputs(node, lookup);
            let mut run = self.executor.execute(scope, node, tool.as_ref(), inputs, cancel).await;
            if let Some(output) = run.output.clone().filter(NodeOutput::is_stream) {
                match output.materialize().await {
                    Ok((_, replay)) => run.output = Some(replay),
                    Err(e) => tracing::warn!("Aggregation node '{}' stream unavailable: {}", name, e),
                }
            }

            let output = (run.status == NodeStatus::Completed)
                .then(|| run.output.clone())
                .flatten();
            outputs.insert(name.clone(), output);
            runs.push(run);
        }

        (runs, outputs)
    }

    fn is_aggregation(&self, node: &str) -> bool {
        self.graph.find_node(node).is_some_and(|n| n.aggregation)
    }

    fn aggregate(&self, reference: &Reference, lines: &[LineResult], runs: &[NodeRun]) -> Option<Value> {
        if let Some(name) = reference.node_name() {
            if self.is_aggregation(name) {
                let run = runs.iter().find(|run| run.node == name)?;
                if run.status != NodeStatus::Completed {
                    return None;
                }
                return output_value(run.output.as_ref()?)?.get_path(&reference.path);
            }
        }
        Some(Value::Array(
            lines
                .iter()
                .map(|line| line_value(line, reference).unwrap_or(Value::Null))
                .collect(),
        ))
    }
}

/// Resolve `reference` against one finished line.
fn line_value(line: &LineResult, reference: &Reference) -> Option<Value> {
    match &reference.source {
        RefSource::Inputs => {
            let (name, rest) = reference.path.split_first()?;
            line.inputs.get(name)?.get_path(rest)
        }
        RefSource::Node(name) => {
            let run = line.node_run(name)?;
            if run.status != NodeStatus::Completed {
                return None;
            }
            output_value(run.output.as_ref()?)?.get_path(&reference.path)
        }
    }
}

fn output_value(output: &NodeOutput) -> Option<Value> {
    match output {
        NodeOutput::Value(value) => Some(value.clone()),
        NodeOutput::Stream(ValueStream::Replayable(chunks)) => Some(Value::Array(chunks.to_vec())),
        NodeOutput::Stream(ValueStream::OneShot(_)) => None,
    }
}

/// Buffer the one-shot stream `node` produced on every line, keeping line
/// outputs that pass the same stream through in sync.
async fn materialize_line_streams(lines: &mut [LineResult], node: &str) {
    for line in lines.iter_mut() {
        let Some(run) = line.node_runs.iter_mut().find(|run| run.node == node) else {
            continue;
        };
        let original = match &run.output {
            Some(output @ NodeOutput::Stream(stream)) if !stream.is_restartable() => output.clone(),
            _ => continue,
        };
        let replay = match original.materialize().await {
            Ok((_, replay)) => replay,
            Err(e) => {
                tracing::warn!("Line {}: stream of '{}' unavailable: {}", line.line_number, node, e);
                continue;
            }
        };
        run.output = Some(replay.clone());
        for output in line.outputs.values_mut() {
            if output.as_ref() == Some(&original) {
                *output = Some(replay.clone());
            }
        }
    }
}
