use crate::{GraphError, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Source a reference expression reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefSource {
    /// `${inputs.<name>}`
    Inputs,
    /// `${<node>.output}`
    Node(String),
}

/// A parsed `${source.field}` expression.
///
/// For flow inputs the first path segment is the input name; for nodes the
/// path walks into the node's output value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference {
    pub source: RefSource,
    pub path: Vec<String>,
}

impl Reference {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            source: RefSource::Inputs,
            path: vec![name.into()],
        }
    }

    pub fn node(name: impl Into<String>) -> Self {
        Self {
            source: RefSource::Node(name.into()),
            path: Vec::new(),
        }
    }

    /// Append a path segment.
    pub fn field(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment.into());
        self
    }

    /// Referenced node name, if this points at a node output.
    pub fn node_name(&self) -> Option<&str> {
        match &self.source {
            RefSource::Node(name) => Some(name),
            RefSource::Inputs => None,
        }
    }

    pub fn parse(expr: &str) -> Result<Self, GraphError> {
        let invalid = || GraphError::InvalidReference(expr.to_string());
        let body = expr
            .trim()
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(invalid)?;

        let mut segments = body.split('.').map(str::trim);
        let source = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let rest: Vec<String> = segments.map(str::to_string).collect();
        if rest.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        if source == "inputs" {
            if rest.is_empty() {
                return Err(invalid());
            }
            return Ok(Self {
                source: RefSource::Inputs,
                path: rest,
            });
        }

        match rest.split_first() {
            Some((head, path)) if head == "output" => Ok(Self {
                source: RefSource::Node(source.to_string()),
                path: path.to_vec(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            RefSource::Inputs => write!(f, "${{inputs")?,
            RefSource::Node(name) => write!(f, "${{{}.output", name)?,
        }
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        write!(f, "}}")
    }
}

impl FromStr for Reference {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

impl TryFrom<String> for Reference {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Reference::parse(&value)
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.to_string()
    }
}

/// A node input: either a literal or a lookup resolved once per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Literal(Value),
    Reference(Reference),
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Binding::Literal(value)
    }
}

impl From<Reference> for Binding {
    fn from(reference: Reference) -> Self {
        Binding::Reference(reference)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub name: String,
    pub binding: Binding,
}

/// Run the node only when `when` resolves to `is`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateCondition {
    pub when: Reference,
    pub is: Value,
}

/// Declared type of a flow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Bool,
    List,
    Object,
    #[default]
    Any,
}

impl ValueType {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueType::Any, _) => true,
            (ValueType::String, Value::String(_)) => true,
            (ValueType::Number, Value::Number(_)) => true,
            (ValueType::Bool, Value::Bool(_)) => true,
            (ValueType::List, Value::Array(_)) => true,
            (ValueType::Object, Value::Object(_)) => true,
            (ValueType::String, Value::Json(j)) => j.is_string(),
            (ValueType::Number, Value::Json(j)) => j.is_number(),
            (ValueType::Bool, Value::Json(j)) => j.is_boolean(),
            (ValueType::List, Value::Json(j)) => j.is_array(),
            (ValueType::Object, Value::Json(j)) => j.is_object(),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Bool => "bool",
            ValueType::List => "list",
            ValueType::Object => "object",
            ValueType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInput {
    pub name: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowOutput {
    pub name: String,
    pub reference: Reference,
    /// A required output fails the line when its source did not complete.
    #[serde(default)]
    pub required: bool,
}

/// Node specification in a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    /// Tool registry key of the callable.
    pub tool: String,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    #[serde(default)]
    pub activate: Option<ActivateCondition>,
    #[serde(default)]
    pub aggregation: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub bypass_on_upstream_failure: bool,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            inputs: Vec::new(),
            activate: None,
            aggregation: false,
            cache: false,
            timeout_ms: None,
            bypass_on_upstream_failure: false,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, binding: impl Into<Binding>) -> Self {
        self.inputs.push(InputBinding {
            name: name.into(),
            binding: binding.into(),
        });
        self
    }

    pub fn with_activate(mut self, when: Reference, is: impl Into<Value>) -> Self {
        self.activate = Some(ActivateCondition { when, is: is.into() });
        self
    }

    pub fn aggregation(mut self) -> Self {
        self.aggregation = true;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn bypass_on_upstream_failure(mut self) -> Self {
        self.bypass_on_upstream_failure = true;
        self
    }

    /// Every reference this node reads, including its activation condition.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.inputs
            .iter()
            .filter_map(|input| match &input.binding {
                Binding::Reference(r) => Some(r),
                Binding::Literal(_) => None,
            })
            .chain(self.activate.as_ref().map(|a| &a.when))
    }

    /// Distinct upstream node names, in first-reference order.
    pub fn upstream_nodes(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.references()
            .filter_map(Reference::node_name)
            .filter(|name| seen.insert(*name))
            .collect()
    }
}

/// Complete flow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<FlowInput>,
    #[serde(default)]
    pub outputs: Vec<FlowOutput>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

impl FlowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.inputs.push(FlowInput {
            name: name.into(),
            value_type,
            default: None,
        });
        self
    }

    pub fn with_input_default(
        mut self,
        name: impl Into<String>,
        value_type: ValueType,
        default: impl Into<Value>,
    ) -> Self {
        self.inputs.push(FlowInput {
            name: name.into(),
            value_type,
            default: Some(default.into()),
        });
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, reference: Reference) -> Self {
        self.outputs.push(FlowOutput {
            name: name.into(),
            reference,
            required: false,
        });
        self
    }

    pub fn with_required_output(mut self, name: impl Into<String>, reference: Reference) -> Self {
        self.outputs.push(FlowOutput {
            name: name.into(),
            reference,
            required: true,
        });
        self
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn find_input(&self, name: &str) -> Option<&FlowInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Check names and references. Cycles are detected by the resolver.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(GraphError::EmptyNodeName);
            }
            if !names.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        for node in &self.nodes {
            for reference in node.references() {
                self.check_reference(&node.name, reference)?;
                if let Some(target) = reference.node_name().and_then(|n| self.find_node(n)) {
                    if target.aggregation && !node.aggregation {
                        return Err(GraphError::InvalidAggregationReference {
                            referrer: node.name.clone(),
                            aggregation: target.name.clone(),
                        });
                    }
                }
            }
        }

        for output in &self.outputs {
            let referrer = format!("output:{}", output.name);
            self.check_reference(&referrer, &output.reference)?;
            if let Some(target) = output.reference.node_name().and_then(|n| self.find_node(n)) {
                if target.aggregation {
                    return Err(GraphError::InvalidAggregationReference {
                        referrer,
                        aggregation: target.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn check_reference(&self, referrer: &str, reference: &Reference) -> Result<(), GraphError> {
        let resolved = match &reference.source {
            RefSource::Inputs => reference
                .path
                .first()
                .is_some_and(|name| self.find_input(name).is_some()),
            RefSource::Node(name) => self.find_node(name).is_some(),
        };
        if resolved {
            Ok(())
        } else {
            Err(GraphError::UnresolvedReference {
                node: referrer.to_string(),
                reference: reference.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_and_node_references() {
        let input = Reference::parse("${inputs.question}").unwrap();
        assert_eq!(input, Reference::input("question"));

        let nested = Reference::parse("${fetch.output.body.0}").unwrap();
        assert_eq!(nested, Reference::node("fetch").field("body").field("0"));
        assert_eq!(nested.to_string(), "${fetch.output.body.0}");
    }

    #[test]
    fn rejects_malformed_references() {
        for expr in ["inputs.x", "${inputs}", "${node.result}", "${.output}", "${a.output..b}"] {
            assert!(
                matches!(Reference::parse(expr), Err(GraphError::InvalidReference(_))),
                "{expr} should be rejected"
            );
        }
    }

    #[test]
    fn validate_catches_dangling_and_duplicate_names() {
        let graph = FlowGraph::new("g")
            .with_node(NodeSpec::new("a", "echo"))
            .with_node(NodeSpec::new("b", "echo").with_input("x", Reference::node("z")));
        assert!(matches!(
            graph.validate(),
            Err(GraphError::UnresolvedReference { ref node, .. }) if node == "b"
        ));

        let graph = FlowGraph::new("g")
            .with_node(NodeSpec::new("a", "echo"))
            .with_node(NodeSpec::new("a", "echo"));
        assert_eq!(graph.validate(), Err(GraphError::DuplicateNode("a".into())));
    }

    #[test]
    fn line_nodes_may_not_read_aggregation_nodes() {
        let graph = FlowGraph::new("g")
            .with_node(NodeSpec::new("agg", "sum").aggregation())
            .with_node(NodeSpec::new("b", "echo").with_input("x", Reference::node("agg")));
        assert!(matches!(
            graph.validate(),
            Err(GraphError::InvalidAggregationReference { .. })
        ));
    }

    #[test]
    fn graph_round_trips_through_json() {
        let graph = FlowGraph::new("g")
            .with_input("q", ValueType::String)
            .with_node(NodeSpec::new("a", "echo").with_input("text", Reference::input("q")))
            .with_output("answer", Reference::node("a"));
        let json = serde_json::to_string(&graph).unwrap();
        assert!(json.contains("${inputs.q}"));
        let parsed: FlowGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, graph);
    }
}
