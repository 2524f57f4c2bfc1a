use chrono::Utc;
use flowcore::{NodeError, NodeOutput, NodeRun, NodeStatus, RefSource, Reference, Value, ValueStream};
use std::collections::HashMap;

/// Per-line scratch state.
///
/// Owned by exactly one flow runner invocation and never shared between
/// lines.
#[derive(Debug)]
pub struct ExecutionContext {
    line_number: usize,
    inputs: HashMap<String, Value>,
    order: Vec<String>,
    runs: HashMap<String, NodeRun>,
}

impl ExecutionContext {
    pub fn new(line_number: usize, inputs: HashMap<String, Value>, order: &[String]) -> Self {
        let runs = order
            .iter()
            .map(|name| (name.clone(), NodeRun::new(name.clone())))
            .collect();
        Self {
            line_number,
            inputs,
            order: order.to_vec(),
            runs,
        }
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }

    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inputs
    }

    pub fn status(&self, node: &str) -> NodeStatus {
        self.runs
            .get(node)
            .map(|run| run.status)
            .unwrap_or(NodeStatus::NotStarted)
    }

    pub fn run(&self, node: &str) -> Option<&NodeRun> {
        self.runs.get(node)
    }

    pub fn mark_running(&mut self, node: &str, inputs: HashMap<String, Value>) {
        if let Some(run) = self.runs.get_mut(node) {
            run.status = NodeStatus::Running;
            run.inputs = inputs;
            run.start_time = Some(Utc::now());
        }
    }

    pub fn mark_bypassed(&mut self, node: &str) {
        if let Some(run) = self.runs.get_mut(node) {
            let now = Utc::now();
            run.status = NodeStatus::Bypassed;
            run.output = None;
            run.start_time = Some(now);
            run.end_time = Some(now);
        }
    }

    /// Store a finished node run.
    pub fn record(&mut self, run: NodeRun) {
        self.runs.insert(run.node.clone(), run);
    }

    /// Mark every node that has not finished as canceled. Returns how many
    /// nodes were affected.
    pub fn cancel_unfinished(&mut self) -> usize {
        let now = Utc::now();
        let mut canceled = 0;
        for run in self.runs.values_mut() {
            if matches!(run.status, NodeStatus::NotStarted | NodeStatus::Running) {
                if run.status == NodeStatus::Running {
                    run.end_time = Some(now);
                }
                run.status = NodeStatus::Canceled;
                run.error = Some(NodeError::Canceled { node: run.node.clone() });
                canceled += 1;
            }
        }
        canceled
    }

    pub fn any_with_status(&self, status: NodeStatus) -> bool {
        self.runs.values().any(|run| run.status == status)
    }

    /// Resolve a reference against this line.
    ///
    /// Returns `None` when the source has no value (not completed, failed,
    /// bypassed) or the path does not exist.
    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        match &reference.source {
            RefSource::Inputs => {
                let (name, rest) = reference.path.split_first()?;
                self.inputs.get(name)?.get_path(rest)
            }
            RefSource::Node(name) => {
                let run = self.runs.get(name)?;
                if run.status != NodeStatus::Completed {
                    return None;
                }
                match run.output.as_ref()? {
                    NodeOutput::Value(value) => value.get_path(&reference.path),
                    NodeOutput::Stream(ValueStream::Replayable(chunks)) => {
                        Value::Array(chunks.to_vec()).get_path(&reference.path)
                    }
                    NodeOutput::Stream(ValueStream::OneShot(_)) => None,
                }
            }
        }
    }

    /// Node runs in plan order.
    pub fn into_node_runs(mut self) -> Vec<NodeRun> {
        self.order
            .iter()
            .filter_map(|name| self.runs.remove(name))
            .collect()
    }
}
