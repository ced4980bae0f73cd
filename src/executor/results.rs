use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::ExecutionContext;
use crate::error::ExecutorError;
use crate::kube::LmEvalJob;
use crate::models::{safe_duration_seconds, EvaluationResult, MetricValue};

/// Flatten `{task: {metric: value}}` into a metric map.
///
/// Only numeric values survive. Names are prefixed with `{task}_` when more
/// than one task is present.
pub fn flatten_metrics(results: &serde_json::Map<String, Value>) -> HashMap<String, MetricValue> {
    let prefix = results.len() > 1;
    let mut metrics = HashMap::new();
    for (task, task_results) in results {
        let Some(task_results) = task_results.as_object() else {
            continue;
        };
        for (metric, value) in task_results {
            if let Some(v) = MetricValue::from_json_number(value) {
                let name = if prefix {
                    format!("{}_{}", task, metric)
                } else {
                    metric.clone()
                };
                metrics.insert(name, v);
            }
        }
    }
    metrics
}

/// Harness output nests scores under `"results"`; older payloads are the bare map.
pub fn task_results(document: &Value) -> Option<&serde_json::Map<String, Value>> {
    match document.get("results") {
        Some(Value::Object(map)) => Some(map),
        _ => document.as_object(),
    }
}

pub fn parse_results_document(raw: &str) -> Result<Value, ExecutorError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw)
        .map_err(|e| ExecutorError::backend(format!("Failed to parse CR results: {}", e)))
}

pub fn parse_complete_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Convert a successfully completed job into a result.
pub fn parse_cr_results(
    job: &LmEvalJob,
    context: &ExecutionContext,
) -> Result<EvaluationResult, ExecutorError> {
    let status = job.status.clone().unwrap_or_default();
    let document = parse_results_document(status.results.as_deref().unwrap_or("{}"))?;

    let metrics = document
        .get("results")
        .and_then(Value::as_object)
        .map(flatten_metrics)
        .unwrap_or_default();

    let completed_at = parse_complete_time(status.complete_time.as_deref());
    let duration = match status.complete_time {
        Some(_) => Some(safe_duration_seconds(completed_at, context.started_at)),
        None => document
            .get("total_evaluation_time_seconds")
            .and_then(|v| v.as_f64().or_else(|| v.as_str()?.parse().ok())),
    };

    let mut artifacts = HashMap::new();
    artifacts.insert("cr_name".to_string(), job.metadata.name.clone());
    artifacts.insert("namespace".to_string(), job.metadata.namespace.clone());

    let mut result = EvaluationResult::completed(
        context.evaluation_id,
        &context.backend_spec.name,
        &context.benchmark_spec.name,
        context.started_at,
    )
    .with_metrics(metrics)
    .with_artifacts(artifacts)
    .with_metadata(json!({
        "cr_name": job.metadata.name,
        "namespace": job.metadata.namespace,
        "pod_name": status.pod_name,
        "raw_results": document,
    }));
    result.completed_at = Some(completed_at);
    result.duration_seconds = duration;
    Ok(result)
}
