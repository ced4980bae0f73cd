use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::models::{EvaluationResult, EvaluationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub request_id: Uuid,
    pub state: RequestState,
    pub total_results: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub completed_at: Option<DateTime<Utc>>,
    pub aggregated_metrics: BTreeMap<String, Value>,
}

fn count_by_status(results: &[EvaluationResult]) -> HashMap<EvaluationStatus, usize> {
    let mut counts = HashMap::new();
    for r in results {
        *counts.entry(r.status).or_insert(0) += 1;
    }
    counts
}

fn overall_state(counts: &HashMap<EvaluationStatus, usize>, expected: usize) -> RequestState {
    let count = |s: EvaluationStatus| counts.get(&s).copied().unwrap_or(0);

    if counts.is_empty() {
        return RequestState::Pending;
    }
    if count(EvaluationStatus::Running) > 0 {
        return RequestState::Running;
    }
    if count(EvaluationStatus::Pending) > 0 {
        return RequestState::Pending;
    }
    if count(EvaluationStatus::Failed) > 0 {
        return RequestState::Failed;
    }
    if expected > 0 && count(EvaluationStatus::Cancelled) >= expected {
        return RequestState::Cancelled;
    }
    if expected > 0 && count(EvaluationStatus::Completed) >= expected {
        return RequestState::Completed;
    }
    RequestState::Pending
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Sample standard deviation; zero for a single value.
fn stdev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn most_used(counts: &BTreeMap<&str, usize>) -> String {
    counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Per-metric statistics over completed results plus request-level totals.
pub fn aggregate_metrics(results: &[EvaluationResult]) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if results.is_empty() {
        return out;
    }

    let completed: Vec<&EvaluationResult> = results.iter().filter(|r| r.is_success()).collect();
    if completed.is_empty() {
        out.insert("status".to_string(), json!("no_completed_evaluations"));
        return out;
    }

    let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for r in &completed {
        for (name, value) in &r.metrics {
            if let Some(v) = value.as_f64() {
                values.entry(name.as_str()).or_default().push(v);
            }
        }
    }

    for (name, mut vals) in values {
        vals.sort_by(|a, b| a.total_cmp(b));
        let mean = vals.iter().sum::<f64>() / vals.len() as f64;
        out.insert(format!("{}_mean", name), json!(mean));
        out.insert(format!("{}_median", name), json!(median(&vals)));
        out.insert(format!("{}_min", name), json!(vals[0]));
        out.insert(format!("{}_max", name), json!(vals[vals.len() - 1]));
        out.insert(format!("{}_std", name), json!(stdev(&vals, mean)));
        out.insert(format!("{}_count", name), json!(vals.len()));
    }

    out.insert("total_evaluations".to_string(), json!(results.len()));
    out.insert("completed_evaluations".to_string(), json!(completed.len()));
    out.insert(
        "success_rate".to_string(),
        json!(completed.len() as f64 / results.len() as f64),
    );

    let durations: Vec<f64> = completed.iter().filter_map(|r| r.duration_seconds).collect();
    if !durations.is_empty() {
        let total: f64 = durations.iter().sum();
        out.insert(
            "avg_duration_seconds".to_string(),
            json!(total / durations.len() as f64),
        );
        out.insert("total_duration_seconds".to_string(), json!(total));
    }

    let mut backends: BTreeMap<&str, usize> = BTreeMap::new();
    let mut benchmarks: BTreeMap<&str, usize> = BTreeMap::new();
    for r in &completed {
        *backends.entry(r.backend_name.as_str()).or_insert(0) += 1;
        *benchmarks.entry(r.benchmark_name.as_str()).or_insert(0) += 1;
    }
    out.insert("backends_used".to_string(), json!(backends.len()));
    out.insert("benchmarks_used".to_string(), json!(benchmarks.len()));
    out.insert("most_used_backend".to_string(), json!(most_used(&backends)));
    out.insert("most_used_benchmark".to_string(), json!(most_used(&benchmarks)));

    out
}

pub fn build_summary(request_id: Uuid, results: &[EvaluationResult]) -> RequestSummary {
    let counts = count_by_status(results);
    let state = overall_state(&counts, results.len());

    let completed_at = if state.is_terminal() {
        results
            .iter()
            .filter_map(|r| r.completed_at)
            .max()
            .or_else(|| Some(Utc::now()))
    } else {
        None
    };

    RequestSummary {
        request_id,
        state,
        total_results: results.len(),
        status_counts: counts
            .into_iter()
            .map(|(s, n)| (s.as_str().to_string(), n))
            .collect(),
        completed_at,
        aggregated_metrics: aggregate_metrics(results),
    }
}
