//! Built-in stand-ins for backend types that have no registered executor.
//!
//! They walk through ten progress steps over a fixed duration and return
//! metrics derived from a hash of the evaluation id, so repeated runs of the
//! same evaluation report the same numbers.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{ExecutionContext, Executor};
use crate::error::ExecutorError;
use crate::models::{BackendType, EvaluationResult, MetricValue};
use crate::progress::{report, ProgressCallback};

const STEPS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Harness,
    GuideLlm,
}

impl Profile {
    fn base_duration(&self) -> Duration {
        match self {
            Self::Harness => Duration::from_secs(30),
            Self::GuideLlm => Duration::from_secs(20),
        }
    }
}

pub struct SimulatedExecutor {
    profile: Profile,
    total: Duration,
}

impl SimulatedExecutor {
    /// `speed` scales the simulated duration; `0.0` finishes immediately and
    /// scales past `Duration::MAX` saturate.
    pub fn new(backend_type: BackendType, speed: f64) -> Result<Self, ExecutorError> {
        let profile = match backend_type {
            BackendType::LmEvaluationHarness => Profile::Harness,
            BackendType::GuideLlm => Profile::GuideLlm,
            other => return Err(ExecutorError::UnsupportedBackend(other.to_string())),
        };
        let speed = if speed.is_finite() { speed.max(0.0) } else { 1.0 };
        Ok(Self {
            profile,
            total: Duration::try_from_secs_f64(profile.base_duration().as_secs_f64() * speed)
                .unwrap_or(Duration::MAX),
        })
    }

    fn metrics(&self, evaluation_id: &Uuid) -> HashMap<String, MetricValue> {
        let h = seed(evaluation_id);
        let mut metrics = HashMap::new();
        match self.profile {
            Profile::Harness => {
                metrics.insert("accuracy".into(), (0.85 + (h % 100) as f64 / 1000.0).into());
                metrics.insert("perplexity".into(), (2.3 + (h % 50) as f64 / 100.0).into());
                metrics.insert("bleu_score".into(), (0.75 + (h % 25) as f64 / 1000.0).into());
            }
            Profile::GuideLlm => {
                metrics.insert(
                    "throughput_tokens_per_second".into(),
                    (150 + (h % 50) as i64).into(),
                );
                metrics.insert("latency_p50_ms".into(), (45 + (h % 20) as i64).into());
                metrics.insert("latency_p95_ms".into(), (85 + (h % 30) as i64).into());
                metrics.insert("error_rate".into(), (0.01 + (h % 5) as f64 / 1000.0).into());
            }
        }
        metrics
    }
}

fn seed(evaluation_id: &Uuid) -> u64 {
    let digest = Sha256::digest(evaluation_id.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[async_trait]
impl Executor for SimulatedExecutor {
    fn backend_type(&self) -> &'static str {
        match self.profile {
            Profile::Harness => BackendType::LmEvaluationHarness.as_str(),
            Profile::GuideLlm => BackendType::GuideLlm.as_str(),
        }
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
        let benchmark = &context.benchmark_spec.name;
        let step = self.total / STEPS;

        for i in 1..=STEPS {
            tokio::time::sleep(step).await;
            let pct = (i * 10) as f64;
            let message = match self.profile {
                Profile::Harness => format!("Running {} - {}% complete", benchmark, pct),
                Profile::GuideLlm => {
                    format!("Running {} with GuideLLM - {}% complete", benchmark, pct)
                }
            };
            report(progress, &key, pct, &message);
        }

        let (artifact_key, artifact_path) = match self.profile {
            Profile::Harness => (
                "results_json",
                format!("/tmp/results_{}_{}.json", key, benchmark),
            ),
            Profile::GuideLlm => (
                "performance_report",
                format!("/tmp/perf_{}_{}.json", key, benchmark),
            ),
        };
        let mut artifacts = HashMap::new();
        artifacts.insert(artifact_key.to_string(), artifact_path);

        EvaluationResult::completed(
            context.evaluation_id,
            &context.backend_spec.name,
            benchmark,
            context.started_at,
        )
        .with_metrics(self.metrics(&context.evaluation_id))
        .with_artifacts(artifacts)
    }

    fn display_name(&self) -> String {
        match self.profile {
            Profile::Harness => "Simulated LM Evaluation Harness".to_string(),
            Profile::GuideLlm => "Simulated GuideLLM".to_string(),
        }
    }
}
