mod common;

use async_trait::async_trait;
use common::*;
use flowcore::{
    CacheError, CacheKey, CacheStore, CachedResult, EventBus, ExecutionEvent, InMemoryCache,
    NodeError, NodeSpec, NodeStatus, Tool, ToolError, ToolErrorKind, ToolOutput, Value,
};
use flowruntime::{NodeExecutor, RunScope};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn scope() -> RunScope {
    RunScope {
        run_id: Uuid::new_v4(),
        line_number: Some(0),
    }
}

fn counting_tool(calls: Arc<AtomicUsize>) -> Arc<dyn Tool> {
    tool(move |inputs| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::value(number(inputs, "x") * 10.0).with_metric("tokens", 3.0))
    })
}

struct BrokenCache;

#[async_trait]
impl CacheStore for BrokenCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CachedResult>, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn put(&self, _key: &CacheKey, _entry: CachedResult) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn test_cache_hit_skips_invocation() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let tool = counting_tool(calls.clone());
    let cache = Arc::new(InMemoryCache::new());
    let executor = NodeExecutor::new(Arc::new(EventBus::default())).with_cache(cache.clone());
    let node = NodeSpec::new("score", "counting").cached();
    let cancel = CancellationToken::new();

    let first = executor
        .execute(scope(), &node, tool.as_ref(), row(&[("x", Value::from(2.0))]), &cancel)
        .await;
    let second = executor
        .execute(scope(), &node, tool.as_ref(), row(&[("x", Value::from(2.0))]), &cancel)
        .await;
    let other = executor
        .execute(scope(), &node, tool.as_ref(), row(&[("x", Value::from(3.0))]), &cancel)
        .await;

    assert!(!first.cached);
    assert!(second.cached);
    assert!(!other.cached);
    assert_eq!(second.output_value(), Some(&Value::Number(20.0)));
    assert_eq!(second.metrics, first.metrics);
    assert_eq!(second.metrics.get("tokens"), Some(&3.0));
    assert_eq!(other.output_value(), Some(&Value::Number(30.0)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn test_uncached_node_always_invokes() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let tool = counting_tool(calls.clone());
    let executor = NodeExecutor::new(Arc::new(EventBus::default())).with_cache(Arc::new(InMemoryCache::new()));
    let node = NodeSpec::new("score", "counting");
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let run = executor
            .execute(scope(), &node, tool.as_ref(), row(&[("x", Value::from(1.0))]), &cancel)
            .await;
        assert_eq!(run.status, NodeStatus::Completed);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cache_store_failure_falls_back_to_invocation() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let tool = counting_tool(calls.clone());
    let executor = NodeExecutor::new(Arc::new(EventBus::default())).with_cache(Arc::new(BrokenCache));
    let node = NodeSpec::new("score", "counting").cached();

    let run = executor
        .execute(
            scope(),
            &node,
            tool.as_ref(),
            row(&[("x", Value::from(4.0))]),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(run.status, NodeStatus::Completed);
    assert!(!run.cached);
    assert_eq!(run.output_value(), Some(&Value::Number(40.0)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tool_errors_are_recorded_with_their_kind() {
    init_tracing();
    let executor = NodeExecutor::new(Arc::new(EventBus::default()));
    let node = NodeSpec::new("call", "flaky");
    let flaky = tool(|_| Err(ToolError::transient("rate limited")));

    let run = executor
        .execute(scope(), &node, flaky.as_ref(), row(&[]), &CancellationToken::new())
        .await;

    assert_eq!(run.status, NodeStatus::Failed);
    assert!(run.output.is_none());
    let error = run.error.unwrap();
    assert!(error.halts_line());
    assert_eq!(
        error,
        NodeError::Execution {
            node: "call".into(),
            kind: ToolErrorKind::Transient,
            message: "rate limited".into(),
        }
    );
}

#[tokio::test]
async fn test_default_timeout_applies_without_node_timeout() {
    init_tracing();
    let executor = NodeExecutor::new(Arc::new(EventBus::default()))
        .with_default_timeout(Some(Duration::from_millis(30)));
    let slow: Arc<dyn Tool> = Arc::new(SleepTool::new(Duration::from_secs(5)));

    let run = executor
        .execute(
            scope(),
            &NodeSpec::new("wait", "slow"),
            slow.as_ref(),
            row(&[]),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(
        run.error,
        Some(NodeError::Timeout {
            node: "wait".into(),
            timeout_ms: 30,
        })
    );

    let overridden = NodeSpec::new("wait", "slow").with_timeout_ms(10);
    assert_eq!(executor.timeout_for(&overridden), Some(Duration::from_millis(10)));
}

#[tokio::test]
async fn test_result_discarded_when_canceled_mid_invocation() {
    init_tracing();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let cancels_itself = tool(move |_| {
        trigger.cancel();
        Ok(ToolOutput::value("late"))
    });
    let executor = NodeExecutor::new(Arc::new(EventBus::default()));

    let run = executor
        .execute(scope(), &NodeSpec::new("late", "t"), cancels_itself.as_ref(), row(&[]), &cancel)
        .await;

    assert_eq!(run.status, NodeStatus::Canceled);
    assert!(run.output.is_none());
}

#[tokio::test]
async fn test_node_events_are_emitted() {
    init_tracing();
    let events = Arc::new(EventBus::default());
    let mut receiver = events.subscribe();
    let executor = NodeExecutor::new(events);

    executor
        .execute(
            scope(),
            &NodeSpec::new("a", "t"),
            tool(|_| Ok(ToolOutput::value(1.0))).as_ref(),
            row(&[]),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(receiver.try_recv(), Ok(ExecutionEvent::NodeStarted { ref node, .. }) if node == "a"));
    assert!(matches!(
        receiver.try_recv(),
        Ok(ExecutionEvent::NodeCompleted { cached: false, line_number: Some(0), .. })
    ));
}
