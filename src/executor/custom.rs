use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{config_string, ExecutionContext, Executor};
use crate::error::ExecutorError;
use crate::models::{BackendConfig, BackendType, BenchmarkSpec, EvaluationResult, MetricValue};
use crate::progress::{report, ProgressCallback};

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    evaluation_id: String,
    model_name: &'a str,
    model_url: &'a str,
    backend_name: &'a str,
    benchmark: &'a BenchmarkSpec,
    timeout_minutes: u64,
    metadata: &'a HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RunResponse {
    #[serde(default)]
    metrics: HashMap<String, MetricValue>,
    #[serde(default)]
    artifacts: HashMap<String, String>,
    #[serde(default)]
    error: Option<String>,
}

/// Delegates a benchmark to an external service that speaks a small JSON protocol:
/// the execution context is POSTed to `endpoint` and `{metrics, artifacts}` comes back.
pub struct CustomHttpExecutor {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl CustomHttpExecutor {
    pub fn new(config: &BackendConfig) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ExecutorError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: config_string(config, "endpoint").filter(|e| !e.is_empty()),
            client,
        })
    }

    async fn call(&self, endpoint: &str, context: &ExecutionContext) -> Result<RunResponse> {
        let body = RunRequest {
            evaluation_id: context.evaluation_key(),
            model_name: &context.model_name,
            model_url: &context.model_url,
            backend_name: &context.backend_spec.name,
            benchmark: &context.benchmark_spec,
            timeout_minutes: context.timeout_minutes,
            metadata: &context.metadata,
        };

        debug!("POST {}", endpoint);
        let resp = self
            .client
            .post(endpoint)
            .timeout(Duration::from_secs(context.timeout_secs().max(1)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach custom backend at {}", endpoint))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "Custom backend returned {}: {}",
                status,
                text.chars().take(500).collect::<String>()
            );
        }

        resp.json()
            .await
            .context("Failed to parse custom backend response")
    }
}

#[async_trait]
impl Executor for CustomHttpExecutor {
    fn backend_type(&self) -> &'static str {
        BackendType::Custom.as_str()
    }

    fn validate_config(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn execute_benchmark(
        &self,
        context: &ExecutionContext,
        progress: Option<&ProgressCallback>,
    ) -> EvaluationResult {
        let key = context.evaluation_key();
        let failed = |msg: String| {
            error!(
                evaluation_id = %key,
                backend = %context.backend_spec.name,
                benchmark = %context.benchmark_spec.name,
                "Custom backend execution failed: {}",
                msg
            );
            EvaluationResult::failed(
                context.evaluation_id,
                &context.backend_spec.name,
                &context.benchmark_spec.name,
                msg,
                context.started_at,
            )
        };

        let Some(endpoint) = self.endpoint.as_deref() else {
            return failed(format!(
                "No endpoint configured for custom backend {}",
                context.backend_spec.name
            ));
        };

        report(
            progress,
            &key,
            0.0,
            &format!("Submitting {} to {}", context.benchmark_spec.name, endpoint),
        );

        match self.call(endpoint, context).await {
            Ok(RunResponse {
                error: Some(err), ..
            }) => failed(err),
            Ok(response) => {
                info!(
                    evaluation_id = %key,
                    benchmark = %context.benchmark_spec.name,
                    metrics = response.metrics.len(),
                    "Custom backend execution completed"
                );
                report(
                    progress,
                    &key,
                    100.0,
                    &format!("Completed {}", context.benchmark_spec.name),
                );
                EvaluationResult::completed(
                    context.evaluation_id,
                    &context.backend_spec.name,
                    &context.benchmark_spec.name,
                    context.started_at,
                )
                .with_metrics(response.metrics)
                .with_artifacts(response.artifacts)
            }
            Err(e) => failed(format!("{:#}", e)),
        }
    }

    fn display_name(&self) -> String {
        "Custom HTTP Executor".to_string()
    }
}
