use crate::aggregation::AggregationRunner;
use crate::runner::{FlowRunner, LineRun};
use chrono::Utc;
use flowcore::{
    merge_metrics, BatchProgress, BatchResult, BatchStatus, BatchSummary, EventBus, ExecutionEvent,
    LineError, LineResult, LineStatus, NodeStatus, ResultSink, RunId, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Settings of one batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Rows executed at the same time.
    pub concurrency: usize,
    /// Deadline of a single line attempt.
    pub row_timeout: Option<Duration>,
    /// Deadline of the whole batch, measured from its start.
    pub batch_timeout: Option<Duration>,
    /// Extra attempts for a row that failed with a transient error.
    pub max_retries: u32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            row_timeout: Some(Duration::from_secs(600)),
            batch_timeout: None,
            max_retries: 0,
        }
    }
}

impl BatchOptions {
    /// Defaults overridden by `FLOW_WORKER_COUNT`, `FLOW_LINE_TIMEOUT_SEC`,
    /// `FLOW_BATCH_TIMEOUT_SEC` and `FLOW_MAX_RETRIES`.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| -> Option<u64> {
            let raw = var(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring {}={:?}: not a non-negative integer", key, raw);
                    None
                }
            }
        };

        if let Some(workers) = parse("FLOW_WORKER_COUNT") {
            self.concurrency = workers as usize;
        }
        if let Some(secs) = parse("FLOW_LINE_TIMEOUT_SEC") {
            self.row_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = parse("FLOW_BATCH_TIMEOUT_SEC") {
            self.batch_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(retries) = parse("FLOW_MAX_RETRIES") {
            self.max_retries = retries as u32;
        }
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_row_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.row_timeout = timeout;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    progress: BatchProgress,
    timed_lines: usize,
    total_line_ms: u64,
}

/// Live counters of a running batch.
#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    concurrency: usize,
}

impl ProgressTracker {
    pub fn new(total: usize, concurrency: usize) -> Self {
        let progress = BatchProgress {
            total,
            pending: total,
            ..BatchProgress::default()
        };
        Self {
            state: Mutex::new(ProgressState {
                progress,
                timed_lines: 0,
                total_line_ms: 0,
            }),
            concurrency: concurrency.max(1),
        }
    }

    pub fn snapshot(&self) -> BatchProgress {
        self.lock().progress
    }

    fn line_started(&self) {
        let mut state = self.lock();
        state.progress.pending = state.progress.pending.saturating_sub(1);
        state.progress.running += 1;
    }

    fn line_finished(&self, line: &LineResult, dispatched: bool) -> BatchProgress {
        let mut state = self.lock();
        if dispatched {
            state.progress.running = state.progress.running.saturating_sub(1);
            state.timed_lines += 1;
            state.total_line_ms += line.duration_ms;
        } else {
            state.progress.pending = state.progress.pending.saturating_sub(1);
        }
        match line.status {
            LineStatus::Completed => state.progress.completed += 1,
            LineStatus::Canceled => state.progress.canceled += 1,
            _ => state.progress.failed += 1,
        }

        if dispatched {
            let average = state.total_line_ms as f64 / state.timed_lines as f64;
            let remaining = (state.progress.pending + state.progress.running) as f64;
            state.progress.average_line_ms = Some(average);
            state.progress.estimated_remaining_ms = Some(average * remaining / self.concurrency as f64);
        }
        state.progress
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State shared by the workers of one batch.
struct BatchShared {
    run_id: RunId,
    runner: Arc<FlowRunner>,
    events: Arc<EventBus>,
    sink: Option<Arc<dyn ResultSink>>,
    options: BatchOptions,
    rows: Vec<HashMap<String, Value>>,
    next_row: AtomicUsize,
    results: Mutex<Vec<Option<LineResult>>>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    /// Set once cancellation actually affected a row.
    cancel_observed: AtomicBool,
    deadline: Option<tokio::time::Instant>,
}

impl BatchShared {
    fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| tokio::time::Instant::now() >= deadline)
    }

    fn observe_cancel(&self) {
        self.cancel_observed.store(true, Ordering::SeqCst);
    }

    fn rows_left(&self) -> bool {
        self.next_row.load(Ordering::SeqCst) < self.rows.len()
    }

    fn batch_timeout_error(&self, line: usize) -> LineError {
        LineError::BatchTimeout {
            line,
            timeout_ms: self
                .options
                .batch_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    /// Row timeout capped by what is left of the batch. The flag is true when
    /// the batch deadline is the binding one.
    fn line_timeout(&self) -> (Option<Duration>, bool) {
        let remaining = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(tokio::time::Instant::now()));
        match (self.options.row_timeout, remaining) {
            (Some(row), Some(left)) if left < row => (Some(left), true),
            (None, Some(left)) => (Some(left), true),
            (row, _) => (row, false),
        }
    }

    /// Run one row, retrying transient failures.
    async fn run_row(&self, index: usize) -> LineResult {
        let inputs = &self.rows[index];
        let mut attempt = 1;
        loop {
            let (timeout, batch_bound) = self.line_timeout();
            if batch_bound && timeout.is_some_and(|t| t.is_zero()) {
                let mut line = LineResult::not_run(
                    index,
                    inputs.clone(),
                    LineStatus::Failed,
                    self.batch_timeout_error(index),
                );
                line.attempts = attempt - 1;
                return line;
            }

            let line_run = LineRun {
                run_id: self.run_id,
                line_number: index,
                attempt,
                timeout,
            };
            let mut line = self.runner.run_line(line_run, inputs.clone(), &self.cancel).await;

            if batch_bound && matches!(line.error, Some(LineError::RowTimeout { .. })) {
                line.error = Some(self.batch_timeout_error(index));
                return line;
            }

            let retryable = line.error.as_ref().is_some_and(LineError::is_retryable);
            if retryable && attempt <= self.options.max_retries && self.cancel.is_cancelled() {
                self.observe_cancel();
            } else if retryable && attempt <= self.options.max_retries {
                tracing::warn!(
                    "Line {} failed with a transient error (attempt {}/{}), retrying",
                    index,
                    attempt,
                    self.options.max_retries + 1
                );
                attempt += 1;
                continue;
            }
            return line;
        }
    }

    async fn complete_line(&self, line: LineResult, dispatched: bool) {
        if line.status == LineStatus::Canceled {
            self.observe_cancel();
        }
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist_line(self.run_id, &line).await {
                tracing::warn!("Failed to persist line {}: {}", line.line_number, e);
            }
        }

        let progress = self.progress.line_finished(&line, dispatched);
        log_progress(&progress);
        self.events.emit(ExecutionEvent::BatchProgress {
            run_id: self.run_id,
            progress,
            timestamp: Utc::now(),
        });

        let index = line.line_number;
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = results.get_mut(index) {
            *slot = Some(line);
        }
    }
}

fn log_progress(progress: &BatchProgress) {
    tracing::info!(
        "Finished {} / {} lines.",
        progress.finished(),
        progress.total
    );
    if let (Some(average), Some(estimate)) = (progress.average_line_ms, progress.estimated_remaining_ms) {
        tracing::info!(
            "Average execution time for completed lines: {:.2} seconds. Estimated time for incomplete lines: {:.2} seconds.",
            average / 1000.0,
            estimate / 1000.0
        );
    }
    tracing::debug!(
        "Finished: {}, Processing: {}, Pending: {}",
        progress.finished(),
        progress.running,
        progress.pending
    );
}

/// Worker: claim rows until none are left or dispatch stops.
async fn worker(shared: Arc<BatchShared>) {
    loop {
        if shared.cancel.is_cancelled() {
            if shared.rows_left() {
                shared.observe_cancel();
            }
            return;
        }
        if shared.deadline_passed() {
            return;
        }
        let index = shared.next_row.fetch_add(1, Ordering::SeqCst);
        if index >= shared.rows.len() {
            return;
        }
        if shared.cancel.is_cancelled() {
            let line = LineResult::not_run(
                index,
                shared.rows[index].clone(),
                LineStatus::Canceled,
                LineError::Canceled,
            );
            shared.complete_line(line, false).await;
            return;
        }

        shared.progress.line_started();
        let line = shared.run_row(index).await;
        shared.complete_line(line, true).await;
    }
}

/// Drives a bounded pool of workers over the rows of one batch.
pub struct BatchScheduler {
    runner: Arc<FlowRunner>,
    aggregation: AggregationRunner,
    events: Arc<EventBus>,
    sink: Option<Arc<dyn ResultSink>>,
    options: BatchOptions,
}

impl BatchScheduler {
    pub fn new(
        runner: Arc<FlowRunner>,
        aggregation: AggregationRunner,
        events: Arc<EventBus>,
        options: BatchOptions,
    ) -> Self {
        Self {
            runner,
            aggregation,
            events,
            sink: None,
            options,
        }
    }

    pub fn with_sink(mut self, sink: Option<Arc<dyn ResultSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Execute every row and return results in input order.
    ///
    /// Row failures are recorded per line and never abort the batch.
    pub async fn run(
        &self,
        run_id: RunId,
        rows: Vec<HashMap<String, Value>>,
        progress: Arc<ProgressTracker>,
        cancel: CancellationToken,
    ) -> BatchResult {
        let start_time = Utc::now();
        let started = Instant::now();
        let total = rows.len();
        let flow_name = self.runner.graph().name.clone();
        let workers = self.options.concurrency.clamp(1, total.max(1));

        tracing::info!(
            "Starting batch {} of flow '{}': {} lines, {} workers",
            run_id,
            flow_name,
            total,
            workers
        );
        self.events.emit(ExecutionEvent::BatchStarted {
            run_id,
            flow_name: flow_name.clone(),
            total_lines: total,
            timestamp: start_time,
        });

        let shared = Arc::new(BatchShared {
            run_id,
            runner: self.runner.clone(),
            events: self.events.clone(),
            sink: self.sink.clone(),
            options: self.options.clone(),
            results: Mutex::new(vec![None; total]),
            rows,
            next_row: AtomicUsize::new(0),
            progress,
            cancel: cancel.clone(),
            cancel_observed: AtomicBool::new(false),
            deadline: self
                .options
                .batch_timeout
                .map(|t| tokio::time::Instant::now() + t),
        });

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(worker(shared.clone()));
        }
        let mut worker_failure = None;
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Batch worker terminated abnormally: {}", e);
                worker_failure.get_or_insert_with(|| e.to_string());
            }
        }

        // A cancel that arrives after every row finished changes nothing.
        let canceled = shared.cancel_observed.load(Ordering::SeqCst);
        let timed_out = !canceled && shared.deadline_passed();
        let claimed = shared.next_row.load(Ordering::SeqCst).min(total);

        let slots = std::mem::take(&mut *shared.results.lock().unwrap_or_else(PoisonError::into_inner));
        let mut lines = Vec::with_capacity(total);
        for (index, slot) in slots.into_iter().enumerate() {
            let line = match slot {
                Some(line) => line,
                None => {
                    // Claimed rows without a result lost their worker mid-run.
                    let dispatched = index < claimed;
                    let (status, error) = if !dispatched && canceled {
                        (LineStatus::Canceled, LineError::Canceled)
                    } else if !dispatched && timed_out {
                        (LineStatus::Failed, shared.batch_timeout_error(index))
                    } else {
                        let reason = worker_failure.as_deref().unwrap_or("no worker left to run it");
                        let error = LineError::Execution(format!("batch worker terminated abnormally: {reason}"));
                        (LineStatus::Failed, error)
                    };
                    let line = LineResult::not_run(index, shared.rows[index].clone(), status, error);
                    shared.complete_line(line.clone(), dispatched).await;
                    line
                }
            };
            lines.push(line);
        }

        let (aggregation_runs, aggregation_outputs) = if canceled {
            tracing::info!("Batch {} canceled, skipping aggregation", run_id);
            (Vec::new(), HashMap::new())
        } else {
            self.aggregation.run(run_id, &mut lines, &cancel).await
        };
        let canceled = canceled
            || aggregation_runs
                .iter()
                .any(|run| run.status == NodeStatus::Canceled);

        let mut system_metrics = HashMap::new();
        for line in &lines {
            merge_metrics(&mut system_metrics, &line.system_metrics);
        }
        for run in &aggregation_runs {
            merge_metrics(&mut system_metrics, &run.metrics);
        }

        let summary = BatchSummary::from_lines(&lines);
        let status = if canceled {
            BatchStatus::Canceled
        } else if timed_out {
            BatchStatus::TimedOut
        } else if summary.total > 0 && summary.failed == summary.total {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = BatchResult {
            run_id,
            flow_name,
            status,
            lines,
            summary,
            aggregation_runs,
            aggregation_outputs,
            system_metrics,
            start_time,
            end_time: Utc::now(),
            duration_ms,
        };

        tracing::info!(
            "Batch {} {:?}: {} completed, {} failed, {} canceled in {}ms",
            run_id,
            status,
            summary.completed,
            summary.failed,
            summary.canceled,
            duration_ms
        );
        self.events.emit(ExecutionEvent::BatchCompleted {
            run_id,
            status,
            summary,
            duration_ms,
            timestamp: Utc::now(),
        });

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist_batch(&result).await {
                tracing::warn!("Failed to persist batch {}: {}", run_id, e);
            }
        }
        result
    }
}
