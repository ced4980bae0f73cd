use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Backend-specific configuration; keys and value shapes are owned by each executor.
pub type BackendConfig = serde_json::Map<String, serde_json::Value>;

const DEFAULT_TIMEOUT_MINUTES: u64 = 60;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BackendType {
    #[serde(rename = "lm-evaluation-harness")]
    LmEvaluationHarness,
    #[serde(rename = "guidellm")]
    GuideLlm,
    #[serde(rename = "custom")]
    Custom,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LmEvaluationHarness => "lm-evaluation-harness",
            Self::GuideLlm => "guidellm",
            Self::Custom => "custom",
        }
    }

    /// Backends whose benchmarks are merged into a single job per backend.
    pub fn groups_benchmarks(&self) -> bool {
        matches!(self, Self::LmEvaluationHarness)
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkSpec {
    pub name: String,
    pub tasks: Vec<String>,
    #[serde(default)]
    pub num_fewshot: Option<i64>,
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub config: BackendConfig,
}

#[cfg(test)]
impl BenchmarkSpec {
    pub fn new(name: impl Into<String>, tasks: Vec<String>) -> Self {
        Self {
            name: name.into(),
            tasks,
            num_fewshot: None,
            batch_size: None,
            limit: None,
            device: None,
            config: BackendConfig::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    #[serde(default)]
    pub config: BackendConfig,
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub model_name: String,
    #[serde(default)]
    pub model_url: String,
    pub backends: Vec<BackendSpec>,
    #[serde(default)]
    pub risk_category: Option<RiskCategory>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_timeout_minutes() -> u64 {
    DEFAULT_TIMEOUT_MINUTES
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    pub evaluations: Vec<EvaluationSpec>,
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Numeric JSON values only; strings, bools and containers are skipped.
    pub fn from_json_number(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// Terminal record of one executed benchmark (or benchmark group).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub evaluation_id: Uuid,
    pub backend_name: String,
    pub benchmark_name: String,
    #[serde(default)]
    pub benchmark_id: Option<String>,
    pub status: EvaluationStatus,
    #[serde(default)]
    pub metrics: HashMap<String, MetricValue>,
    #[serde(default)]
    pub artifacts: HashMap<String, String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub tracking_run_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl EvaluationResult {
    pub fn completed(
        evaluation_id: Uuid,
        backend_name: impl Into<String>,
        benchmark_name: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            evaluation_id,
            backend_name: backend_name.into(),
            benchmark_name: benchmark_name.into(),
            benchmark_id: None,
            status: EvaluationStatus::Completed,
            metrics: HashMap::new(),
            artifacts: HashMap::new(),
            error_message: None,
            started_at: Some(started_at),
            completed_at: Some(now),
            duration_seconds: Some(safe_duration_seconds(now, started_at)),
            tracking_run_id: None,
            metadata: None,
        }
    }

    pub fn failed(
        evaluation_id: Uuid,
        backend_name: impl Into<String>,
        benchmark_name: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            status: EvaluationStatus::Failed,
            error_message: Some(error.into()),
            ..Self::completed(evaluation_id, backend_name, benchmark_name, started_at)
        }
        .with_completed_at(now)
    }

    /// Failure that never started any work (fan-in substitutes).
    pub fn failed_immediately(
        evaluation_id: Uuid,
        backend_name: impl Into<String>,
        benchmark_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut result = Self::failed(evaluation_id, backend_name, benchmark_name, error, now);
        result.duration_seconds = Some(0.0);
        result
    }

    pub fn with_metrics(mut self, metrics: HashMap<String, MetricValue>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_artifacts(mut self, artifacts: HashMap<String, String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Flag a failure that was caused by a deadline inside the executor.
    pub fn mark_timed_out(mut self) -> Self {
        let mut metadata = match self.metadata.take() {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert("timed_out".to_string(), serde_json::Value::Bool(true));
        self.metadata = Some(serde_json::Value::Object(metadata));
        self
    }

    pub fn timed_out(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("timed_out"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub fn with_tracking_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.tracking_run_id = Some(run_id.into());
        self
    }

    pub fn with_completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = Some(completed_at);
        if let Some(started) = self.started_at {
            self.duration_seconds = Some(safe_duration_seconds(completed_at, started));
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == EvaluationStatus::Completed
    }

    #[cfg(test)]
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(MetricValue::as_f64)
    }
}

/// Seconds between two instants, clamped at zero for clock skew.
pub fn safe_duration_seconds(end: DateTime<Utc>, start: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds();
    (millis.max(0) as f64) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_type_wire_names() {
        assert_eq!(
            serde_json::to_value(BackendType::LmEvaluationHarness).unwrap(),
            json!("lm-evaluation-harness")
        );
        assert_eq!(BackendType::GuideLlm.as_str(), "guidellm");
        let parsed: BackendType = serde_json::from_value(json!("custom")).unwrap();
        assert_eq!(parsed, BackendType::Custom);
        assert!(BackendType::LmEvaluationHarness.groups_benchmarks());
        assert!(!BackendType::Custom.groups_benchmarks());
    }

    #[test]
    fn test_evaluation_spec_defaults() {
        let spec: EvaluationSpec = serde_json::from_value(json!({
            "name": "Test",
            "model_name": "test-model",
            "backends": []
        }))
        .unwrap();
        assert_eq!(spec.timeout_minutes, 60);
        assert_eq!(spec.retry_attempts, 3);
        assert_eq!(spec.priority, 0);
        assert!(spec.risk_category.is_none());
        assert!(spec.model_url.is_empty());
        assert!(spec.metadata.is_empty());
    }

    #[test]
    fn test_benchmark_spec_parses_backend_fields() {
        let backend: BackendSpec = serde_json::from_value(json!({
            "name": "harness",
            "type": "lm-evaluation-harness",
            "config": {"namespace": "evals"},
            "benchmarks": [
                {"name": "hellaswag", "tasks": ["hellaswag"], "num_fewshot": 5, "limit": 100}
            ]
        }))
        .unwrap();
        assert_eq!(backend.backend_type, BackendType::LmEvaluationHarness);
        assert_eq!(backend.benchmarks[0].num_fewshot, Some(5));
        assert_eq!(backend.benchmarks[0].limit, Some(100));
        assert!(backend.benchmarks[0].config.is_empty());
        assert_eq!(backend.config["namespace"], "evals");
    }

    #[test]
    fn test_metric_value_untagged() {
        let metrics: HashMap<String, MetricValue> =
            serde_json::from_value(json!({"acc": 0.8, "n": 12, "note": "ok"})).unwrap();
        assert_eq!(metrics["acc"], MetricValue::Float(0.8));
        assert_eq!(metrics["n"], MetricValue::Int(12));
        assert_eq!(metrics["note"].as_f64(), None);
    }

    #[test]
    fn test_metric_from_json_number_skips_non_numeric() {
        assert_eq!(
            MetricValue::from_json_number(&json!(3)),
            Some(MetricValue::Int(3))
        );
        assert_eq!(
            MetricValue::from_json_number(&json!(0.25)),
            Some(MetricValue::Float(0.25))
        );
        assert_eq!(MetricValue::from_json_number(&json!("0.5")), None);
        assert_eq!(MetricValue::from_json_number(&json!(true)), None);
    }

    #[test]
    fn test_failed_result_carries_error() {
        let id = Uuid::new_v4();
        let started = Utc::now() - chrono::Duration::seconds(5);
        let result = EvaluationResult::failed(id, "b", "arc", "boom", started);
        assert_eq!(result.status, EvaluationStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert!(result.duration_seconds.unwrap() >= 5.0);
        assert!(!result.is_success());
        assert!(!result.timed_out());
    }

    #[test]
    fn test_timed_out_flag_keeps_existing_metadata() {
        let result = EvaluationResult::failed_immediately(Uuid::new_v4(), "b", "arc", "late")
            .with_metadata(serde_json::json!({"cr_name": "lmeval-job-1"}))
            .mark_timed_out();
        assert!(result.timed_out());
        assert_eq!(result.metadata.unwrap()["cr_name"], "lmeval-job-1");
    }

    #[test]
    fn test_safe_duration_clamps_negative() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(10);
        assert_eq!(safe_duration_seconds(now, later), 0.0);
        assert_eq!(safe_duration_seconds(later, now), 10.0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(EvaluationStatus::Completed.is_terminal());
        assert!(EvaluationStatus::Failed.is_terminal());
        assert!(EvaluationStatus::Cancelled.is_terminal());
        assert!(!EvaluationStatus::Running.is_terminal());
        assert!(!EvaluationStatus::Pending.is_terminal());
    }
}
