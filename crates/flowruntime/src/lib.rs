//! Flow execution runtime
//!
//! This crate resolves flow graphs into execution plans and runs them: one
//! line at a time through [`FlowRunner`], or over many input rows through the
//! bounded worker pool of [`BatchScheduler`]. [`FlowRuntime`] wires the pieces
//! together.

mod aggregation;
mod batch;
mod context;
mod executor;
mod registry;
mod resolver;
mod runner;
mod runtime;

pub use aggregation::{AggregationOutcome, AggregationRunner};
pub use batch::{BatchOptions, BatchScheduler, ProgressTracker};
pub use context::ExecutionContext;
pub use executor::{resolve_inputs, NodeExecutor, RunScope};
pub use registry::{NodeTools, ToolRegistry};
pub use resolver::{DependencyResolver, ExecutionPlan};
pub use runner::{FlowRunner, LineRun};
pub use runtime::{BatchHandle, FlowRuntime, RuntimeConfig, TestResult};
