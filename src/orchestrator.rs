//! Fan-out of evaluation requests onto executors.
//!
//! A request fans out per evaluation, each evaluation per backend, and each
//! backend per benchmark (or once per backend when its type groups benchmarks
//! into a single job). Every innermost run holds a permit of the shared
//! semaphore for its whole retry sequence. Failures at any level turn into
//! `failed` results; siblings never observe each other's errors or panics.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ExecutorError;
use crate::executor::registry::builtin_executor;
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::metrics::Metrics;
use crate::models::{
    BackendConfig, BackendSpec, BenchmarkSpec, EvaluationResult, EvaluationSpec, EvaluationStatus,
};
use crate::progress::{report, ProgressCallback};
use crate::tasks::{TaskInfo, TaskTracker};

const UNKNOWN: &str = "unknown";

/// Merge a grouped backend's benchmarks into one run.
///
/// Tasks are concatenated in order and configs merged so that later benchmarks
/// override earlier ones. Few-shot, batch size, limit and device come from the
/// first benchmark.
pub fn combine_benchmarks(benchmarks: &[BenchmarkSpec]) -> Option<BenchmarkSpec> {
    let first = benchmarks.first()?;
    let names: Vec<&str> = benchmarks.iter().map(|b| b.name.as_str()).collect();

    let mut config = BackendConfig::new();
    let mut tasks = Vec::new();
    for benchmark in benchmarks {
        tasks.extend(benchmark.tasks.iter().cloned());
        for (k, v) in &benchmark.config {
            config.insert(k.clone(), v.clone());
        }
    }

    Some(BenchmarkSpec {
        name: format!("collection-{}", names.join("-")),
        tasks,
        num_fewshot: first.num_fewshot,
        batch_size: first.batch_size,
        limit: first.limit,
        device: first.device.clone(),
        config,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[derive(Clone)]
pub struct EvaluationExecutor {
    registry: Arc<ExecutorRegistry>,
    semaphore: Arc<Semaphore>,
    tasks: Arc<TaskTracker>,
    metrics: Arc<Metrics>,
    simulation_speed: f64,
}

impl EvaluationExecutor {
    pub fn new(settings: &Config, registry: Arc<ExecutorRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent_evaluations.max(1))),
            tasks: Arc::new(TaskTracker::new(Duration::from_secs(
                settings.task_retention_secs,
            ))),
            metrics,
            simulation_speed: settings.simulation_speed,
        }
    }

    pub fn tasks(&self) -> Arc<TaskTracker> {
        Arc::clone(&self.tasks)
    }

    /// Run every evaluation concurrently and collect one result per benchmark run.
    pub async fn execute_evaluation_request(
        &self,
        evaluations: Vec<EvaluationSpec>,
        progress: Option<ProgressCallback>,
    ) -> Vec<EvaluationResult> {
        if evaluations.is_empty() {
            return Vec::new();
        }

        let start = Instant::now();
        info!(evaluations = evaluations.len(), "Executing evaluation request");

        let mut handles = Vec::with_capacity(evaluations.len());
        for spec in evaluations {
            let this = self.clone();
            let progress = progress.clone();
            let id = spec.id;
            let handle =
                tokio::spawn(async move { this.execute_single_evaluation(spec, progress).await });
            handles.push((id, handle));
        }

        let mut results = Vec::new();
        for (id, handle) in handles {
            match handle.await {
                Ok(batch) => results.extend(batch),
                Err(e) => {
                    error!(evaluation_id = %id, error = %e, "Evaluation task aborted");
                    results.push(EvaluationResult::failed_immediately(
                        id,
                        UNKNOWN,
                        UNKNOWN,
                        format!("Evaluation task aborted: {}", e),
                    ));
                }
            }
        }

        for result in &results {
            self.metrics.record_result(result);
        }
        info!(
            results = results.len(),
            failed = results.iter().filter(|r| !r.is_success()).count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Evaluation request finished"
        );
        results
    }

    pub fn get_active_evaluations(&self) -> Vec<TaskInfo> {
        self.tasks.list()
    }

    /// Advisory only: in-flight attempts keep running.
    pub fn cancel_evaluation(&self, evaluation_id: &Uuid) -> bool {
        self.tasks.cancel(evaluation_id)
    }

    pub fn get_evaluation_status(&self, evaluation_id: &Uuid) -> Option<TaskInfo> {
        self.tasks.get(evaluation_id)
    }

    async fn execute_single_evaluation(
        &self,
        spec: EvaluationSpec,
        progress: Option<ProgressCallback>,
    ) -> Vec<EvaluationResult> {
        let start = Instant::now();
        let spec = Arc::new(spec);
        self.tasks.start(&spec);
        info!(
            evaluation_id = %spec.id,
            model = %spec.model_name,
            backends = spec.backends.len(),
            "Evaluation started"
        );

        let tracker = Arc::clone(&self.tasks);
        let evaluation_id = spec.id;
        let tracked: ProgressCallback = Arc::new(move |id: &str, percent: f64, message: &str| {
            tracker.update_progress(&evaluation_id, percent, message);
            if let Some(ref cb) = progress {
                cb(id, percent, message);
            }
        });

        let mut handles = Vec::with_capacity(spec.backends.len());
        for backend in spec.backends.iter().cloned() {
            let this = self.clone();
            let spec = Arc::clone(&spec);
            let cb = Arc::clone(&tracked);
            let name = backend.name.clone();
            let handle =
                tokio::spawn(async move { this.execute_backend(spec, backend, cb).await });
            handles.push((name, handle));
        }

        let mut results = Vec::new();
        for (backend_name, handle) in handles {
            match handle.await {
                Ok(batch) => results.extend(batch),
                Err(e) => {
                    error!(
                        evaluation_id = %spec.id,
                        backend = %backend_name,
                        error = %e,
                        "Backend task aborted"
                    );
                    results.push(EvaluationResult::failed_immediately(
                        spec.id,
                        backend_name,
                        UNKNOWN,
                        format!("Backend task aborted: {}", e),
                    ));
                }
            }
        }

        let status = if results.iter().all(EvaluationResult::is_success) {
            EvaluationStatus::Completed
        } else {
            EvaluationStatus::Failed
        };
        self.tasks.finish(&spec.id, status);
        info!(
            evaluation_id = %spec.id,
            status = ?status,
            results = results.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Evaluation finished"
        );
        results
    }

    async fn execute_backend(
        &self,
        spec: Arc<EvaluationSpec>,
        backend: BackendSpec,
        progress: ProgressCallback,
    ) -> Vec<EvaluationResult> {
        info!(
            evaluation_id = %spec.id,
            backend = %backend.name,
            backend_type = %backend.backend_type,
            benchmarks = backend.benchmarks.len(),
            "Starting backend execution"
        );

        if backend.backend_type.groups_benchmarks() {
            let Some(combined) = combine_benchmarks(&backend.benchmarks) else {
                warn!(
                    evaluation_id = %spec.id,
                    backend = %backend.name,
                    "Grouped backend has no benchmarks"
                );
                return vec![EvaluationResult::failed_immediately(
                    spec.id,
                    &backend.name,
                    "collection-",
                    format!("Backend {} has no benchmarks to run", backend.name),
                )];
            };
            info!(
                evaluation_id = %spec.id,
                backend = %backend.name,
                combined = %combined.name,
                tasks = ?combined.tasks,
                "Grouped benchmarks into a single execution"
            );
            return vec![
                self.execute_benchmark(&spec, &backend, combined, &progress)
                    .await,
            ];
        }

        let backend = Arc::new(backend);
        let mut handles = Vec::with_capacity(backend.benchmarks.len());
        for benchmark in backend.benchmarks.iter().cloned() {
            let this = self.clone();
            let spec = Arc::clone(&spec);
            let backend = Arc::clone(&backend);
            let cb = Arc::clone(&progress);
            let name = benchmark.name.clone();
            let handle = tokio::spawn(async move {
                this.execute_benchmark(&spec, &backend, benchmark, &cb)
                    .await
            });
            handles.push((name, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (benchmark_name, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(EvaluationResult::failed_immediately(
                    spec.id,
                    &backend.name,
                    benchmark_name,
                    format!("Benchmark task aborted: {}", e),
                )),
            }
        }
        results
    }

    /// One (evaluation, backend, benchmark) run including retries.
    async fn execute_benchmark(
        &self,
        spec: &EvaluationSpec,
        backend: &BackendSpec,
        benchmark: BenchmarkSpec,
        progress: &ProgressCallback,
    ) -> EvaluationResult {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return EvaluationResult::failed_immediately(
                    spec.id,
                    &backend.name,
                    &benchmark.name,
                    "Execution gate closed",
                )
            }
        };

        if spec.model_url.trim().is_empty() {
            let msg = format!(
                "Model URL is required but not provided for evaluation {}",
                spec.id
            );
            error!(evaluation_id = %spec.id, backend = %backend.name, "{}", msg);
            return EvaluationResult::failed_immediately(spec.id, &backend.name, &benchmark.name, msg);
        }

        let context = ExecutionContext {
            evaluation_id: spec.id,
            model_url: spec.model_url.clone(),
            model_name: spec.model_name.clone(),
            backend_spec: backend.clone(),
            benchmark_spec: benchmark,
            timeout_minutes: spec.timeout_minutes,
            retry_attempts: spec.retry_attempts,
            started_at: chrono::Utc::now(),
            metadata: spec.metadata.clone(),
        };
        let benchmark_name = context.benchmark_spec.name.clone();
        let max_attempts = context.retry_attempts.saturating_add(1);

        info!(
            evaluation_id = %spec.id,
            backend = %backend.name,
            benchmark = %benchmark_name,
            model = %spec.model_name,
            "Starting benchmark execution"
        );

        let mut last_error = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.metrics.record_retry();
                info!(
                    evaluation_id = %spec.id,
                    backend = %backend.name,
                    benchmark = %benchmark_name,
                    attempt = attempt + 1,
                    max_attempts,
                    "Retrying benchmark execution"
                );
            }

            match self.run_attempt(&context, progress).await {
                Ok(result) => return result,
                Err(e) if !e.is_retryable() => {
                    error!(
                        evaluation_id = %spec.id,
                        backend = %backend.name,
                        benchmark = %benchmark_name,
                        error = %e,
                        "Benchmark execution failed permanently"
                    );
                    return EvaluationResult::failed(
                        spec.id,
                        &backend.name,
                        &benchmark_name,
                        e.to_string(),
                        context.started_at,
                    );
                }
                Err(e) => {
                    if matches!(e, ExecutorError::Timeout(_)) {
                        self.metrics.record_timeout();
                    }
                    warn!(
                        evaluation_id = %spec.id,
                        backend = %backend.name,
                        benchmark = %benchmark_name,
                        attempt = attempt + 1,
                        error = %e,
                        "Benchmark execution attempt failed"
                    );
                    last_error = Some(e);
                    if attempt + 1 < max_attempts {
                        let backoff = Duration::from_secs(1u64 << attempt.min(16));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        EvaluationResult::failed(
            spec.id,
            &backend.name,
            &benchmark_name,
            format!("Failed after {} attempts: {}", max_attempts, last),
            context.started_at,
        )
    }

    /// One attempt under the per-attempt deadline; panics become backend errors.
    async fn run_attempt(
        &self,
        context: &ExecutionContext,
        progress: &ProgressCallback,
    ) -> Result<EvaluationResult, ExecutorError> {
        let deadline = Duration::from_secs(context.timeout_secs());
        let attempt = AssertUnwindSafe(self.dispatch(context, progress)).catch_unwind();

        match tokio::time::timeout(deadline, attempt).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => Err(ExecutorError::backend(format!(
                "Executor panicked: {}",
                panic_message(&*panic)
            ))),
            Err(_) => Err(ExecutorError::timeout(format!(
                "Benchmark execution timed out after {} minutes",
                context.timeout_minutes
            ))),
        }
    }

    async fn dispatch(
        &self,
        context: &ExecutionContext,
        progress: &ProgressCallback,
    ) -> Result<EvaluationResult, ExecutorError> {
        let backend = &context.backend_spec;
        let backend_type = backend.backend_type.as_str();
        let key = context.evaluation_key();

        let registered = self.registry.is_backend_supported(backend_type);
        let executor = if registered {
            self.registry.create_executor(backend_type, &backend.config)?
        } else {
            debug!(
                evaluation_id = %key,
                backend_type = %backend_type,
                "No registered executor, using built-in implementation"
            );
            report(
                Some(progress),
                &key,
                0.0,
                &format!("Starting {} on {}", context.benchmark_spec.name, backend.name),
            );
            builtin_executor(backend.backend_type, &backend.config, self.simulation_speed)?
        };

        if !executor.health_check().await {
            warn!(
                evaluation_id = %key,
                executor = %executor.display_name(),
                "Backend health check failed, proceeding anyway"
            );
        }

        let result = executor.execute_benchmark(context, Some(progress)).await;

        if let Err(e) = executor.cleanup().await {
            warn!(
                evaluation_id = %key,
                executor = %executor.display_name(),
                error = %e,
                "Executor cleanup failed"
            );
        }

        if result.status == EvaluationStatus::Failed {
            let timed_out = result.timed_out();
            let message = result
                .error_message
                .unwrap_or_else(|| "Benchmark execution failed".to_string());
            return Err(if timed_out {
                ExecutorError::timeout(message)
            } else {
                ExecutorError::backend(message)
            });
        }

        if !registered {
            report(
                Some(progress),
                &key,
                100.0,
                &format!("Completed {} on {}", context.benchmark_spec.name, backend.name),
            );
        }
        Ok(result)
    }
}
