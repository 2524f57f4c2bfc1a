mod common;

use common::*;
use flowcore::{FlowError, FlowGraph, GraphError, NodeSpec, Reference, ToolOutput, ValueType};
use flowruntime::{DependencyResolver, FlowRuntime, ToolRegistry, RuntimeConfig};

fn position(order: &[String], name: &str) -> usize {
    order.iter().position(|n| n == name).unwrap()
}

#[test]
fn test_every_node_follows_its_references() {
    init_tracing();

    // Declared out of dependency order on purpose.
    let graph = FlowGraph::new("diamond")
        .with_input("q", ValueType::String)
        .with_node(
            NodeSpec::new("join", "t")
                .with_input("l", Reference::node("left"))
                .with_input("r", Reference::node("right").field("text")),
        )
        .with_node(NodeSpec::new("left", "t").with_input("x", Reference::node("root")))
        .with_node(NodeSpec::new("right", "t").with_input("x", Reference::node("root")))
        .with_node(NodeSpec::new("root", "t").with_input("q", Reference::input("q")))
        .with_node(NodeSpec::new("side", "t"));

    let plan = DependencyResolver::resolve(&graph).unwrap();
    let order = plan.line_order();
    assert_eq!(order.len(), 5);

    for node in &graph.nodes {
        for upstream in node.upstream_nodes() {
            assert!(
                position(order, upstream) < position(order, &node.name),
                "{} must run before {}",
                upstream,
                node.name
            );
        }
    }
    assert_eq!(plan.upstream("join"), ["left", "right"]);
    assert_eq!(order, ["root", "left", "right", "join", "side"]);
}

#[test]
fn test_resolution_is_deterministic() {
    let graph = FlowGraph::new("g")
        .with_node(NodeSpec::new("b", "t"))
        .with_node(NodeSpec::new("a", "t"))
        .with_node(NodeSpec::new("c", "t").with_input("x", Reference::node("a")));

    let first = DependencyResolver::resolve(&graph).unwrap();
    let second = DependencyResolver::resolve(&graph).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_cycle_is_named() {
    init_tracing();

    let graph = FlowGraph::new("cyclic")
        .with_node(NodeSpec::new("start", "t"))
        .with_node(NodeSpec::new("a", "t").with_input("x", Reference::node("c")))
        .with_node(NodeSpec::new("b", "t").with_input("x", Reference::node("a")))
        .with_node(NodeSpec::new("c", "t").with_input("x", Reference::node("b")))
        .with_node(NodeSpec::new("tail", "t").with_input("x", Reference::node("c")));

    match DependencyResolver::resolve(&graph) {
        Err(GraphError::CyclicDependency { cycle }) => assert_eq!(cycle, ["a", "b", "c"]),
        other => panic!("expected a cycle, got {:?}", other),
    }
}

#[test]
fn test_activation_reference_counts_as_dependency() {
    let graph = FlowGraph::new("g")
        .with_node(NodeSpec::new("gated", "t").with_activate(Reference::node("check"), true))
        .with_node(NodeSpec::new("check", "t"));

    let plan = DependencyResolver::resolve(&graph).unwrap();
    assert_eq!(plan.line_order(), ["check", "gated"]);
}

#[test]
fn test_aggregation_nodes_are_planned_separately() {
    let graph = FlowGraph::new("g")
        .with_node(NodeSpec::new("summary", "t").aggregation().with_input("all", Reference::node("score")))
        .with_node(NodeSpec::new("score", "t"));

    let plan = DependencyResolver::resolve(&graph).unwrap();
    assert_eq!(plan.line_order(), ["score"]);
    assert_eq!(plan.aggregation_order(), ["summary"]);
}

#[test]
fn test_line_node_cannot_read_aggregation() {
    let graph = FlowGraph::new("g")
        .with_node(NodeSpec::new("summary", "t").aggregation())
        .with_node(NodeSpec::new("line", "t").with_input("x", Reference::node("summary")));

    assert_eq!(
        DependencyResolver::resolve(&graph),
        Err(GraphError::InvalidAggregationReference {
            referrer: "line".into(),
            aggregation: "summary".into(),
        })
    );
}

#[test]
fn test_duplicate_node_is_rejected() {
    let graph = FlowGraph::new("g")
        .with_node(NodeSpec::new("a", "t"))
        .with_node(NodeSpec::new("a", "t"));

    assert_eq!(
        DependencyResolver::resolve(&graph),
        Err(GraphError::DuplicateNode("a".into()))
    );
}

#[tokio::test]
async fn test_unresolved_reference_fails_before_any_row_runs() {
    init_tracing();

    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = ToolRegistry::new();
    registry.register(
        "echo",
        tool(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ToolOutput::value("ok"))
        }),
    );
    let runtime = FlowRuntime::with_registry(registry, RuntimeConfig::default());

    let graph = FlowGraph::new("broken")
        .with_node(NodeSpec::new("a", "echo"))
        .with_node(NodeSpec::new("b", "echo").with_input("x", Reference::node("z")));

    let result = runtime
        .run_batch(graph, vec![row(&[]), row(&[])], Default::default())
        .await;

    match result {
        Err(FlowError::Graph(GraphError::UnresolvedReference { node, reference })) => {
            assert_eq!(node, "b");
            assert_eq!(reference, "${z.output}");
        }
        other => panic!("expected unresolved reference, got {:?}", other.map(|r| r.status)),
    }
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn test_unknown_tool_is_reported() {
    let runtime = FlowRuntime::new();
    let graph = FlowGraph::new("g").with_node(NodeSpec::new("a", "missing"));

    match runtime.validate(&graph) {
        Err(FlowError::Graph(GraphError::UnknownTool { node, tool })) => {
            assert_eq!(node, "a");
            assert_eq!(tool, "missing");
        }
        other => panic!("expected unknown tool, got {:?}", other),
    }
}
