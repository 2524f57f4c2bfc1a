use flowcore::{
    Binding, CacheKey, CacheStore, FlowGraph, GraphError, InMemoryCache, NodeOutput, NodeSpec,
    Reference, Value, ValueStream, ValueType,
};
use serde_json::json;
use std::collections::HashMap;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

#[test]
fn test_flow_loads_from_json() {
    init_tracing();

    let definition = json!({
        "name": "qa",
        "inputs": [
            { "name": "question", "value_type": "string" },
            { "name": "top_k", "value_type": "number", "default": { "type": "Number", "value": 3.0 } }
        ],
        "outputs": [
            { "name": "answer", "reference": "${answer.output.text}", "required": true }
        ],
        "nodes": [
            {
                "name": "retrieve",
                "tool": "search",
                "inputs": [
                    { "name": "query", "binding": { "reference": "${inputs.question}" } },
                    { "name": "k", "binding": { "reference": "${inputs.top_k}" } }
                ],
                "cache": true
            },
            {
                "name": "answer",
                "tool": "llm",
                "inputs": [
                    { "name": "context", "binding": { "reference": "${retrieve.output}" } },
                    { "name": "temperature", "binding": { "literal": { "type": "Number", "value": 0.2 } } }
                ],
                "activate": { "when": "${inputs.question}", "is": { "type": "Json", "value": "skip" } },
                "timeout_ms": 30000
            }
        ]
    });

    let graph: FlowGraph = serde_json::from_value(definition).unwrap();
    graph.validate().unwrap();

    assert_eq!(graph.find_input("top_k").unwrap().value_type, ValueType::Number);
    assert_eq!(graph.outputs[0].reference, Reference::node("answer").field("text"));

    let retrieve = graph.find_node("retrieve").unwrap();
    assert!(retrieve.cache);
    assert_eq!(
        retrieve.inputs[0].binding,
        Binding::Reference(Reference::input("question"))
    );

    let answer = graph.find_node("answer").unwrap();
    assert_eq!(answer.upstream_nodes(), ["retrieve"]);
    assert_eq!(answer.timeout_ms, Some(30000));
    assert_eq!(answer.inputs[1].binding, Binding::Literal(Value::Number(0.2)));
}

#[test]
fn test_flow_round_trips_references_as_strings() {
    let graph = FlowGraph::new("g")
        .with_input("q", ValueType::String)
        .with_node(NodeSpec::new("a", "t").with_input("x", Reference::input("q")))
        .with_output("out", Reference::node("a").field("items").field("0"));

    let json = serde_json::to_value(&graph).unwrap();
    assert_eq!(json["outputs"][0]["reference"], "${a.output.items.0}");
    assert_eq!(json["nodes"][0]["inputs"][0]["binding"]["reference"], "${inputs.q}");

    let back: FlowGraph = serde_json::from_value(json).unwrap();
    assert_eq!(back, graph);
}

#[test]
fn test_malformed_reference_is_rejected_on_load() {
    let definition = json!({
        "name": "bad",
        "nodes": [
            { "name": "a", "tool": "t", "inputs": [ { "name": "x", "binding": { "reference": "inputs.x" } } ] }
        ]
    });

    let error = serde_json::from_value::<FlowGraph>(definition).unwrap_err();
    assert!(error.to_string().contains("Invalid reference"), "{error}");
}

#[test]
fn test_output_may_not_read_aggregation_node() {
    let graph = FlowGraph::new("g")
        .with_node(NodeSpec::new("total", "sum").aggregation())
        .with_output("total", Reference::node("total"));

    assert_eq!(
        graph.validate(),
        Err(GraphError::InvalidAggregationReference {
            referrer: "output:total".into(),
            aggregation: "total".into(),
        })
    );
}

#[tokio::test]
async fn test_cache_key_ignores_input_order() {
    init_tracing();

    let mut forward = HashMap::new();
    forward.insert("a".to_string(), Value::from(1.0));
    forward.insert("b".to_string(), Value::Json(json!({ "y": 2, "x": 1 })));
    let mut reverse = HashMap::new();
    reverse.insert("b".to_string(), Value::Json(json!({ "x": 1, "y": 2 })));
    reverse.insert("a".to_string(), Value::from(1.0));

    let key = CacheKey::compute("node", "1", &forward).unwrap();
    assert_eq!(key, CacheKey::compute("node", "1", &reverse).unwrap());
    assert_ne!(key, CacheKey::compute("node", "2", &forward).unwrap());
    assert_ne!(key, CacheKey::compute("other", "1", &forward).unwrap());

    let cache = InMemoryCache::new();
    assert_eq!(cache.get(&key).await.unwrap(), None);
    cache.put(&key, Value::from("hit").into()).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap().map(|hit| hit.value), Some(Value::from("hit")));
}

#[tokio::test]
async fn test_one_shot_stream_is_consumed_once() {
    let output = NodeOutput::Stream(ValueStream::one_shot(futures::stream::iter(vec![
        Value::from("a"),
        Value::from("b"),
    ])));

    let (value, replay) = output.materialize().await.unwrap();
    assert_eq!(value, Value::Array(vec![Value::from("a"), Value::from("b")]));
    assert!(matches!(replay, NodeOutput::Stream(ref s) if s.is_restartable()));

    let NodeOutput::Stream(original) = &output else {
        unreachable!()
    };
    assert!(original.is_consumed());
    assert!(original.take().is_err());
}
