//! lm-evaluation-harness executor.
//!
//! Runs each benchmark (or benchmark group) as an `LMEvalJob` custom resource:
//! build the manifest, upsert it, poll until the operator reports a terminal
//! state, then parse the embedded results. When CR deployment is disabled the
//! harness CLI is spawned locally instead.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::job::{self, JobTemplate};
use super::results::{flatten_metrics, parse_cr_results, task_results};
use super::{config_bool, config_i64, config_string, config_u64, ExecutionContext, Executor};
use crate::config::Config;
use crate::error::{ControlPlaneError, ExecutorError};
use crate::kube::{ControlPlane, LmEvalJob, LmEvalJobStatus};
use crate::models::{BackendConfig, BackendType, EvaluationResult};
use crate::process::{run_cmd, ProcessError};
use crate::progress::{report, ProgressCallback};

const DEFAULT_DEVICE: &str = "cuda:0";
const DEFAULT_LM_EVAL_PATH: &str = "lm_eval";
const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;
const DEFAULT_MAX_RETRIES: u32 = 2;

pub struct LmEvalExecutor {
    model: Option<String>,
    template: JobTemplate,
    cli_model_args: Option<String>,
    device: String,
    output_path: PathBuf,
    lm_eval_path: String,
    timeout_seconds: Option<u64>,
    poll_interval: Duration,
    control_plane: Option<Arc<dyn ControlPlane>>,
    max_retries: u32,
}

impl LmEvalExecutor {
    pub fn new(
        config: &BackendConfig,
        settings: &Config,
        control_plane: Option<Arc<dyn ControlPlane>>,
    ) -> Self {
        let deploy_crs = config_bool(config, "deploy_crs").unwrap_or(settings.deploy_crs);
        let control_plane = match (deploy_crs, control_plane) {
            (true, Some(cp)) => Some(cp),
            (true, None) => {
                warn!("No Kubernetes client available; CR deployment disabled, running lm_eval locally");
                None
            }
            (false, _) => None,
        };

        let template = JobTemplate {
            namespace: config_string(config, "namespace")
                .unwrap_or_else(|| settings.namespace.clone()),
            cr_model: config_string(config, "model_name")
                .unwrap_or_else(|| "local-completions".to_string()),
            batch_size: config_string(config, "batch_size").unwrap_or_else(|| "1".to_string()),
            log_samples: config_bool(config, "log_samples").unwrap_or(true),
            limit: config_i64(config, "limit"),
            num_fewshot: config_i64(config, "num_fewshot").unwrap_or(0),
            model_args: config.get("model_args").cloned(),
            fallback_base_url: config_string(config, "base_url"),
            num_concurrent: config_string(config, "num_concurrent")
                .unwrap_or_else(|| "1".to_string()),
            max_retries: config_string(config, "max_retries").unwrap_or_else(|| "3".to_string()),
            tokenized_requests: config_string(config, "tokenized_requests")
                .unwrap_or_else(|| "False".to_string()),
            tokenizer: config_string(config, "tokenizer")
                .unwrap_or_else(|| "google/flan-t5-base".to_string()),
            secret_name: config_string(config, "secret_name"),
            secret_key: config_string(config, "secret_key").unwrap_or_else(|| "token".to_string()),
        };

        Self {
            model: config_string(config, "model").filter(|m| !m.is_empty()),
            cli_model_args: config.get("model_args").and_then(cli_model_args),
            device: config_string(config, "device").unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            output_path: config_string(config, "output_path")
                .map(PathBuf::from)
                .unwrap_or_else(|| settings.lmeval_output_path.clone()),
            lm_eval_path: config_string(config, "lm_eval_path")
                .unwrap_or_else(|| DEFAULT_LM_EVAL_PATH.to_string()),
            timeout_seconds: config_u64(config, "timeout_seconds"),
            poll_interval: config_u64(config, "poll_interval")
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or_else(|| settings.poll_interval()),
            max_retries: config_u64(config, "max_retries")
                .map(|r| r as u32)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            control_plane,
            template,
        }
    }

    pub fn deploys_crs(&self) -> bool {
        self.control_plane.is_some()
    }

    pub fn namespace(&self) -> &str {
        &self.template.namespace
    }

    /// Status of a submitted job, or `None` when it is missing or unreachable.
    pub async fn get_cr_status(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Option<LmEvalJobStatus> {
        let cp = self.control_plane.as_ref()?;
        let namespace = namespace.unwrap_or(&self.template.namespace);
        match cp.get(namespace, name).await {
            Ok(job) => Some(job.status.unwrap_or_default()),
            Err(ControlPlaneError::NotFound(_)) => None,
            Err(e) => {
                error!(cr_name = %name, namespace = %namespace, error = %e, "Failed to get CR status");
                None
            }
        }
    }

    /// Parsed results document of a job that completed successfully.
    pub async fn get_cr_results(&self, name: &str, namespace: Option<&str>) -> Option<Value> {
        let status = self.get_cr_status(name, namespace).await?;
        if !is_succeeded(&status) {
            return None;
        }
        serde_json::from_str(status.results.as_deref().unwrap_or("{}")).ok()
    }

    async fn run(
        &self,
        context: &ExecutionContext,
        progress: Option<&ProgressCallback>,
    ) -> Result<EvaluationResult, ExecutorError> {
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| context.model_name.clone());
        if model.is_empty() {
            return Err(ExecutorError::backend(
                "Model name is required (either in backend config or context)",
            ));
        }

        let key = context.evaluation_key();
        let benchmark = &context.benchmark_spec.name;
        info!(
            evaluation_id = %key,
            benchmark = %benchmark,
            model = %model,
            "Starting LM Evaluation Harness execution"
        );
        report(
            progress,
            &key,
            0.0,
            &format!("Preparing {} for LM Evaluation Harness", benchmark),
        );

        let tasks = if context.benchmark_spec.tasks.is_empty() {
            vec![benchmark.clone()]
        } else {
            context.benchmark_spec.tasks.clone()
        };

        let Some(cp) = self.control_plane.as_ref() else {
            return self.run_local(context, &tasks, &model, progress).await;
        };

        let manifest = self.template.build(context, &tasks, &model);
        info!(
            evaluation_id = %key,
            benchmark = %benchmark,
            "LMEval Job YAML CR:\n{}",
            job::to_yaml(&manifest)
        );
        report(
            progress,
            &key,
            10.0,
            &format!("Deploying LMEvalJob CR for {}", benchmark),
        );

        self.submit(cp.as_ref(), &manifest).await?;
        info!(
            evaluation_id = %key,
            benchmark = %benchmark,
            namespace = %manifest.metadata.namespace,
            cr_name = %manifest.metadata.name,
            "LMEvalJob CR deployed"
        );

        let result = self
            .wait_for_completion(
                cp.as_ref(),
                &manifest.metadata.namespace,
                &manifest.metadata.name,
                context,
                progress,
            )
            .await?;
        if result.is_success() {
            report(
                progress,
                &key,
                100.0,
                &format!("Completed {} on LM Evaluation Harness", benchmark),
            );
        }
        Ok(result)
    }

    /// Create the job, replacing it in place if the name is already taken.
    async fn submit(&self, cp: &dyn ControlPlane, manifest: &LmEvalJob) -> Result<(), ExecutorError> {
        let namespace = &manifest.metadata.namespace;
        let name = &manifest.metadata.name;
        match cp.create(namespace, manifest).await {
            Ok(()) => Ok(()),
            Err(ControlPlaneError::AlreadyExists(_)) => {
                info!(name = %name, namespace = %namespace, "LMEvalJob CR already exists, updating");
                cp.patch(namespace, name, manifest).await.map_err(|e| {
                    ExecutorError::backend(format!("Failed to deploy LMEvalJob CR: {}", e))
                })
            }
            Err(e) => Err(ExecutorError::backend(format!(
                "Failed to deploy LMEvalJob CR: {}",
                e
            ))),
        }
    }

    async fn wait_for_completion(
        &self,
        cp: &dyn ControlPlane,
        namespace: &str,
        name: &str,
        context: &ExecutionContext,
        progress: Option<&ProgressCallback>,
    ) -> Result<EvaluationResult, ExecutorError> {
        let key = context.evaluation_key();
        let max_wait = self.timeout_seconds.unwrap_or_else(|| context.timeout_secs());
        let start = Instant::now();

        info!(
            evaluation_id = %key,
            cr_name = %name,
            namespace = %namespace,
            timeout_secs = max_wait,
            "Waiting for LMEvalJob CR to complete"
        );

        loop {
            let elapsed = start.elapsed();
            if elapsed.as_secs() > max_wait {
                return Err(ExecutorError::timeout(format!(
                    "LMEvalJob CR {} timed out: did not complete within {} seconds",
                    name, max_wait
                )));
            }

            let job = match cp.get(namespace, name).await {
                Ok(job) => job,
                Err(ControlPlaneError::NotFound(_)) => {
                    return Err(ExecutorError::backend(format!(
                        "LMEvalJob CR {} not found",
                        name
                    )))
                }
                Err(e) => {
                    return Err(ExecutorError::backend(format!(
                        "Failed to get CR status: {}",
                        e
                    )))
                }
            };
            let status = job.status.clone().unwrap_or_default();

            if let Some(last) = status.progress_bars.last() {
                let mean = status
                    .progress_bars
                    .iter()
                    .map(|bar| bar.percent_value())
                    .sum::<f64>()
                    / status.progress_bars.len() as f64;
                report(
                    progress,
                    &key,
                    (10.0 + mean * 0.9).min(99.0),
                    &format!(
                        "LMEvalJob: {}",
                        last.message.as_deref().unwrap_or("Processing")
                    ),
                );
            }

            if status.state.as_deref() == Some("Complete") {
                if is_succeeded(&status) {
                    return parse_cr_results(&job, context);
                }
                let message = status.message.as_deref().unwrap_or("Job failed");
                warn!(evaluation_id = %key, cr_name = %name, reason = ?status.reason, "LMEvalJob CR failed: {}", message);
                let mut result = EvaluationResult::failed(
                    context.evaluation_id,
                    &context.backend_spec.name,
                    &context.benchmark_spec.name,
                    message,
                    context.started_at,
                );
                result.duration_seconds = Some(elapsed.as_secs_f64());
                return Ok(result);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn local_command(
        &self,
        context: &ExecutionContext,
        tasks: &[String],
        model: &str,
        output_file: &Path,
    ) -> Vec<String> {
        let benchmark = &context.benchmark_spec;
        let batch_size = benchmark
            .batch_size
            .map(|b| b.to_string())
            .unwrap_or_else(|| self.template.batch_size.clone());
        let device = benchmark.device.clone().unwrap_or_else(|| self.device.clone());
        let num_fewshot = benchmark
            .num_fewshot
            .or_else(|| config_i64(&benchmark.config, "num_fewshot"))
            .unwrap_or(self.template.num_fewshot);
        let limit = benchmark
            .limit
            .or_else(|| config_i64(&benchmark.config, "limit"))
            .or(self.template.limit);

        let mut argv: Vec<String> = self
            .lm_eval_path
            .split_whitespace()
            .map(String::from)
            .collect();
        argv.extend([
            "--model".to_string(),
            model.to_string(),
            "--tasks".to_string(),
            tasks.join(","),
            "--batch_size".to_string(),
            batch_size,
            "--device".to_string(),
            device,
            "--num_fewshot".to_string(),
            num_fewshot.to_string(),
            "--output_path".to_string(),
            output_file.display().to_string(),
        ]);
        if let Some(ref args) = self.cli_model_args {
            argv.extend(["--model_args".to_string(), args.clone()]);
        }
        if let Some(limit) = limit {
            argv.extend(["--limit".to_string(), limit.to_string()]);
        }
        argv
    }

    async fn run_local(
        &self,
        context: &ExecutionContext,
        tasks: &[String],
        model: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<EvaluationResult, ExecutorError> {
        let key = context.evaluation_key();
        let benchmark = &context.benchmark_spec.name;
        report(
            progress,
            &key,
            20.0,
            &format!("Running evaluation locally for {}", benchmark),
        );

        tokio::fs::create_dir_all(&self.output_path)
            .await
            .map_err(|e| {
                ExecutorError::backend(format!(
                    "Failed to create output directory {}: {}",
                    self.output_path.display(),
                    e
                ))
            })?;

        let file_stem = format!("{}_{}", key, job::sanitize_k8s_name(benchmark));
        let output_file = self.output_path.join(format!("results_{}.json", file_stem));
        let argv = self.local_command(context, tasks, model, &output_file);

        report(progress, &key, 30.0, "Running LM Evaluation Harness evaluation");

        let timeout = Duration::from_secs(self.timeout_seconds.unwrap_or_else(|| context.timeout_secs()));
        let output = run_cmd(&argv, None, timeout).await.map_err(|e| match e {
            ProcessError::TimedOut(d) => ExecutorError::timeout(format!(
                "LM Evaluation Harness execution timed out after {} seconds",
                d.as_secs()
            )),
            other => ExecutorError::backend(format!("Failed to run LM Evaluation Harness: {}", other)),
        })?;

        if !output.success() {
            let stderr = output.stderr.trim();
            return Err(ExecutorError::backend(format!(
                "LM Evaluation Harness failed with return code {}: {}",
                output.exit_code,
                if stderr.is_empty() { "Unknown error" } else { stderr }
            )));
        }

        report(progress, &key, 90.0, "Processing LM Evaluation Harness results");

        let document: Value = match tokio::fs::read_to_string(&output_file).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                ExecutorError::backend(format!(
                    "Failed to parse LM Evaluation Harness output file: {}",
                    e
                ))
            })?,
            Err(_) => serde_json::from_str(output.stdout.trim()).map_err(|_| {
                ExecutorError::backend("Failed to parse LM Evaluation Harness output as JSON")
            })?,
        };

        let metrics = task_results(&document)
            .map(flatten_metrics)
            .unwrap_or_default();

        let full_results = self
            .output_path
            .join(format!("full_results_{}.json", file_stem));
        let pretty = serde_json::to_vec_pretty(&document)
            .map_err(|e| ExecutorError::backend(e.to_string()))?;
        tokio::fs::write(&full_results, pretty).await.map_err(|e| {
            ExecutorError::backend(format!("Failed to write full results: {}", e))
        })?;

        let mut artifacts = HashMap::new();
        artifacts.insert(
            "lmeval_results".to_string(),
            output_file.display().to_string(),
        );
        artifacts.insert(
            "lmeval_full_results".to_string(),
            full_results.display().to_string(),
        );

        report(
            progress,
            &key,
            100.0,
            &format!("Completed {} on LM Evaluation Harness", benchmark),
        );

        Ok(EvaluationResult::completed(
            context.evaluation_id,
            &context.backend_spec.name,
            benchmark,
            context.started_at,
        )
        .with_metrics(metrics)
        .with_artifacts(artifacts))
    }
}

fn is_succeeded(status: &LmEvalJobStatus) -> bool {
    status.state.as_deref() == Some("Complete") && status.reason.as_deref() == Some("Succeeded")
}

/// The CLI takes `k=v,k=v`; objects are rendered into that form.
fn cli_model_args(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) if !map.is_empty() => Some(
            map.iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{}={}", k, s),
                    other => format!("{}={}", k, other),
                })
                .collect::<Vec<_>>()
                .join(","),
        ),
        _ => None,
    }
}

#[async_trait]
impl Executor for LmEvalExecutor {
    fn backend_type(&self) -> &'static str {
        BackendType::LmEvaluationHarness.as_str()
    }

    /// The model may come from the context at run time, so nothing is rejected here.
    fn validate_config(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn execute_benchmark(
        &self,
        context: &ExecutionContext,
        progress: Option<&ProgressCallback>,
    ) -> EvaluationResult {
        match self.run(context, progress).await {
            Ok(result) => {
                info!(
                    evaluation_id = %context.evaluation_id,
                    benchmark = %context.benchmark_spec.name,
                    status = ?result.status,
                    "LM Evaluation Harness execution finished"
                );
                result
            }
            Err(e) => {
                error!(
                    evaluation_id = %context.evaluation_id,
                    benchmark = %context.benchmark_spec.name,
                    error = %e,
                    "LM Evaluation Harness execution failed"
                );
                let result = EvaluationResult::failed(
                    context.evaluation_id,
                    &context.backend_spec.name,
                    &context.benchmark_spec.name,
                    e.to_string(),
                    context.started_at,
                );
                match e {
                    ExecutorError::Timeout(_) => result.mark_timed_out(),
                    _ => result,
                }
            }
        }
    }

    fn display_name(&self) -> String {
        "LM Evaluation Harness Executor".to_string()
    }

    fn recommended_timeout_minutes(&self) -> u64 {
        self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS) / 60
    }

    fn max_retry_attempts(&self) -> u32 {
        self.max_retries
    }
}
