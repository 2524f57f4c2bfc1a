#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{Tool, ToolError, ToolOutput, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

pub fn row(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn number(inputs: &HashMap<String, Value>, name: &str) -> f64 {
    inputs.get(name).and_then(Value::as_f64).unwrap_or_default()
}

struct SyncTool<F>(F);

#[async_trait]
impl<F> Tool for SyncTool<F>
where
    F: Fn(&HashMap<String, Value>) -> Result<ToolOutput, ToolError> + Send + Sync,
{
    async fn invoke(&self, inputs: &HashMap<String, Value>) -> Result<ToolOutput, ToolError> {
        (self.0)(inputs)
    }
}

/// Tool from a plain closure.
pub fn tool<F>(f: F) -> Arc<dyn Tool>
where
    F: Fn(&HashMap<String, Value>) -> Result<ToolOutput, ToolError> + Send + Sync + 'static,
{
    Arc::new(SyncTool(f))
}

/// Sleeps for its `delay_ms` input (or the fixed delay), then echoes `x`.
pub struct SleepTool {
    pub delay: Duration,
    pub calls: Arc<AtomicUsize>,
}

impl SleepTool {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for SleepTool {
    async fn invoke(&self, inputs: &HashMap<String, Value>) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = inputs
            .get("delay_ms")
            .and_then(Value::as_f64)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;
        Ok(ToolOutput::value(inputs.get("x").cloned().unwrap_or(Value::Null)))
    }
}
