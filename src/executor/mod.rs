//! Backend executors and the contract they share.
//!
//! Every backend implements [`Executor`]. The orchestrator never talks to a
//! backend directly: it asks the [`registry::ExecutorRegistry`] for a fresh
//! executor per run, or falls back to the built-in [`simulated`] and
//! [`custom`] variants for backend types that are not registered.

pub mod custom;
pub mod job;
pub mod lmeval;
pub mod registry;
pub mod results;
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::models::{BackendConfig, BackendSpec, BenchmarkSpec, EvaluationResult};
use crate::progress::ProgressCallback;

pub use registry::ExecutorRegistry;

/// Immutable descriptor for one (evaluation, backend, benchmark) run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub evaluation_id: Uuid,
    pub model_url: String,
    pub model_name: String,
    pub backend_spec: BackendSpec,
    pub benchmark_spec: BenchmarkSpec,
    pub timeout_minutes: u64,
    pub retry_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_minutes.saturating_mul(60)
    }

    pub fn evaluation_key(&self) -> String {
        self.evaluation_id.to_string()
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Registry key for this executor variant.
    fn backend_type(&self) -> &'static str;

    /// Called by the registry right after construction.
    fn validate_config(&self) -> Result<(), ExecutorError>;

    /// Best-effort; callers only log a `false`.
    async fn health_check(&self) -> bool {
        true
    }

    /// Run one benchmark. Never fails: every internal error is folded into a
    /// `failed` result carrying the message.
    async fn execute_benchmark(
        &self,
        context: &ExecutionContext,
        progress: Option<&ProgressCallback>,
    ) -> EvaluationResult;

    async fn cleanup(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn display_name(&self) -> String {
        format!("{} Executor", self.backend_type())
    }

    fn supports_parallel_execution(&self) -> bool {
        true
    }

    fn recommended_timeout_minutes(&self) -> u64 {
        60
    }

    fn max_retry_attempts(&self) -> u32 {
        3
    }
}

/// String view of a config value; numbers and booleans are rendered as text.
pub(crate) fn config_string(config: &BackendConfig, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn config_u64(config: &BackendConfig, key: &str) -> Option<u64> {
    match config.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn config_i64(config: &BackendConfig, key: &str) -> Option<i64> {
    match config.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn config_bool(config: &BackendConfig, key: &str) -> Option<bool> {
    match config.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}
