//! Experiment tracking: an MLflow REST client and the reporter that pushes
//! finished results into it. Tracking is best effort; nothing here can fail
//! an evaluation.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{EvaluationRequest, EvaluationResult, EvaluationSpec};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

#[async_trait]
pub trait TrackingSink: Send + Sync {
    /// Id of the experiment named `name`, creating it when missing.
    async fn create_experiment(&self, name: &str, tags: &[(String, String)]) -> Result<String>;
    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        tags: &[(String, String)],
    ) -> Result<String>;
    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()>;
    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()>;
    async fn log_artifact(&self, run_id: &str, name: &str, location: &str) -> Result<()>;
    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Browser link to an experiment, when the sink has a UI.
    fn experiment_url(&self, _experiment_id: &str) -> Option<String> {
        None
    }
}

/// MLflow tracking names reject commas and spaces.
pub fn sanitize_name(name: &str) -> String {
    name.replace([',', ' '], "_")
}

#[derive(Serialize)]
struct Tag<'a> {
    key: &'a str,
    value: &'a str,
}

fn tags_body(tags: &[(String, String)]) -> Vec<Tag<'_>> {
    tags.iter()
        .map(|(k, v)| Tag { key: k, value: v })
        .collect()
}

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentInfo,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunEnvelope {
    run: RunBody,
}

#[derive(Deserialize)]
struct RunBody {
    info: RunInfo,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
}

pub struct MlflowClient {
    client: reqwest::Client,
    base_url: String,
}

impl MlflowClient {
    pub fn new(tracking_uri: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client for MLflow")?;
        Ok(Self {
            client,
            base_url: tracking_uri.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = self.endpoint(path);
        debug!("POST {}", url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach MLflow at {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "MLflow {} returned {}: {}",
                path,
                status,
                text.chars().take(500).collect::<String>()
            );
        }
        Ok(resp)
    }

    async fn find_experiment(&self, name: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(self.endpoint("experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()
            .await
            .context("Failed to query MLflow experiment")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("MLflow experiment lookup returned {}", resp.status());
        }
        let envelope: ExperimentEnvelope = resp
            .json()
            .await
            .context("Failed to parse MLflow experiment")?;
        Ok(Some(envelope.experiment.experiment_id))
    }
}

#[async_trait]
impl TrackingSink for MlflowClient {
    async fn create_experiment(&self, name: &str, tags: &[(String, String)]) -> Result<String> {
        if let Some(id) = self.find_experiment(name).await? {
            info!(experiment = %name, experiment_id = %id, "Using existing MLflow experiment");
            return Ok(id);
        }

        let resp = self
            .post(
                "experiments/create",
                json!({ "name": name, "tags": tags_body(tags) }),
            )
            .await?;
        let created: CreateExperimentResponse = resp
            .json()
            .await
            .context("Failed to parse MLflow create-experiment response")?;
        info!(experiment = %name, experiment_id = %created.experiment_id, "Created MLflow experiment");
        Ok(created.experiment_id)
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        tags: &[(String, String)],
    ) -> Result<String> {
        let resp = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": name,
                    "start_time": chrono::Utc::now().timestamp_millis(),
                    "tags": tags_body(tags),
                }),
            )
            .await?;
        let run: RunEnvelope = resp
            .json()
            .await
            .context("Failed to parse MLflow create-run response")?;
        Ok(run.run.info.run_id)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.post(
            "runs/log-parameter",
            json!({ "run_id": run_id, "key": key, "value": value }),
        )
        .await?;
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        self.post(
            "runs/log-metric",
            json!({
                "run_id": run_id,
                "key": key,
                "value": value,
                "timestamp": chrono::Utc::now().timestamp_millis(),
                "step": 0,
            }),
        )
        .await?;
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, name: &str, location: &str) -> Result<()> {
        self.post(
            "runs/set-tag",
            json!({
                "run_id": run_id,
                "key": format!("artifact.{}", name),
                "value": location,
            }),
        )
        .await?;
        Ok(())
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.post(
            "runs/update",
            json!({
                "run_id": run_id,
                "status": status.as_str(),
                "end_time": chrono::Utc::now().timestamp_millis(),
            }),
        )
        .await?;
        Ok(())
    }

    fn experiment_url(&self, experiment_id: &str) -> Option<String> {
        Some(format!("{}/#/experiments/{}", self.base_url, experiment_id))
    }
}

/// Pushes a finished request's results into a tracking sink.
pub struct ResultReporter {
    sink: Arc<dyn TrackingSink>,
    service_version: String,
}

impl ResultReporter {
    pub fn new(sink: Arc<dyn TrackingSink>) -> Self {
        Self {
            sink,
            service_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn experiment_name(request: &EvaluationRequest) -> String {
        request
            .experiment_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("eval-hub-{}", request.request_id))
    }

    /// Results come back in the same order, tagged with their run ids where
    /// logging worked.
    pub async fn report(
        &self,
        request: &EvaluationRequest,
        results: Vec<EvaluationResult>,
    ) -> Vec<EvaluationResult> {
        let name = Self::experiment_name(request);
        let mut tags = vec![
            ("request_id".to_string(), request.request_id.to_string()),
            ("created_at".to_string(), request.created_at.to_rfc3339()),
            (
                "evaluation_count".to_string(),
                request.evaluations.len().to_string(),
            ),
            ("service_version".to_string(), self.service_version.clone()),
        ];
        tags.extend(request.tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        let experiment_id = match self.sink.create_experiment(&name, &tags).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    experiment = %name,
                    "Tracking unavailable, skipping result logging: {:#}",
                    e
                );
                return results;
            }
        };

        let mut reported = Vec::with_capacity(results.len());
        for result in results {
            let spec = request
                .evaluations
                .iter()
                .find(|e| e.id == result.evaluation_id);
            match self.report_one(&experiment_id, spec, &result).await {
                Ok(run_id) => reported.push(result.with_tracking_run_id(run_id)),
                Err(e) => {
                    warn!(
                        evaluation_id = %result.evaluation_id,
                        benchmark = %result.benchmark_name,
                        "Failed to log result to tracking: {:#}",
                        e
                    );
                    reported.push(result);
                }
            }
        }
        info!(
            request_id = %request.request_id,
            experiment_id = %experiment_id,
            experiment_url = self.sink.experiment_url(&experiment_id).as_deref().unwrap_or("-"),
            runs = reported.iter().filter(|r| r.tracking_run_id.is_some()).count(),
            "Results logged to tracking"
        );
        reported
    }

    async fn report_one(
        &self,
        experiment_id: &str,
        spec: Option<&EvaluationSpec>,
        result: &EvaluationResult,
    ) -> Result<String> {
        let (model_name, model_url) = spec
            .map(|s| (s.model_name.as_str(), s.model_url.as_str()))
            .unwrap_or(("unknown", "unknown"));
        let run_name = format!(
            "{}::{}_{}_{}",
            model_url, model_name, result.backend_name, result.benchmark_name
        );

        let mut params = vec![
            ("model_name".to_string(), model_name.to_string()),
            ("model_url".to_string(), model_url.to_string()),
            ("backend".to_string(), result.backend_name.clone()),
            ("benchmark".to_string(), result.benchmark_name.clone()),
        ];
        if let Some(spec) = spec {
            params.push(("priority".to_string(), spec.priority.to_string()));
            if let Some(risk) = spec.risk_category {
                params.push((
                    "risk_category".to_string(),
                    serde_json::to_value(risk)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default(),
                ));
            }
        }

        let mut tags = vec![("evaluation_id".to_string(), result.evaluation_id.to_string())];
        tags.extend(params.iter().cloned());

        let run_id = self.sink.create_run(experiment_id, &run_name, &tags).await?;

        for (key, value) in &params {
            self.sink.log_param(&run_id, key, value).await?;
        }

        for (key, value) in &result.metrics {
            if let Some(v) = value.as_f64() {
                self.sink.log_metric(&run_id, &sanitize_name(key), v).await?;
            }
        }

        let mut outcome = vec![("status".to_string(), result.status.as_str().to_string())];
        if let Some(d) = result.duration_seconds {
            outcome.push(("duration_seconds".to_string(), d.to_string()));
        }
        if let Some(done) = result.completed_at {
            outcome.push(("completed_at".to_string(), done.to_rfc3339()));
        }
        if let Some(ref err) = result.error_message {
            outcome.push(("error_message".to_string(), err.clone()));
        }
        for (key, value) in &outcome {
            self.sink.log_param(&run_id, key, value).await?;
        }

        for (name, location) in &result.artifacts {
            if location.is_empty() {
                continue;
            }
            if let Err(e) = self.sink.log_artifact(&run_id, name, location).await {
                warn!(run_id = %run_id, artifact = %name, "Failed to log artifact: {:#}", e);
            }
        }

        let terminal = if result.is_success() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        self.sink.set_terminated(&run_id, terminal).await?;

        info!(
            run_id = %run_id,
            evaluation_id = %result.evaluation_id,
            metrics = result.metrics.len(),
            "Logged result to tracking"
        );
        Ok(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvaluationStatus, MetricValue};
    use axum::{
        extract::{Query, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct FakeSink {
        calls: Mutex<Vec<String>>,
        fail_experiment: bool,
        fail_metrics: bool,
        runs: Mutex<usize>,
    }

    #[async_trait]
    impl TrackingSink for FakeSink {
        async fn create_experiment(&self, name: &str, _tags: &[(String, String)]) -> Result<String> {
            if self.fail_experiment {
                bail!("connection refused");
            }
            self.calls.lock().push(format!("experiment {}", name));
            Ok("exp-1".into())
        }

        async fn create_run(
            &self,
            experiment_id: &str,
            name: &str,
            _tags: &[(String, String)],
        ) -> Result<String> {
            let mut runs = self.runs.lock();
            *runs += 1;
            self.calls.lock().push(format!("run {} {}", experiment_id, name));
            Ok(format!("run-{}", *runs))
        }

        async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
            self.calls.lock().push(format!("param {} {}={}", run_id, key, value));
            Ok(())
        }

        async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
            if self.fail_metrics {
                bail!("metric rejected");
            }
            self.calls.lock().push(format!("metric {} {}={}", run_id, key, value));
            Ok(())
        }

        async fn log_artifact(&self, run_id: &str, name: &str, location: &str) -> Result<()> {
            self.calls.lock().push(format!("artifact {} {}={}", run_id, name, location));
            Ok(())
        }

        async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
            self.calls.lock().push(format!("terminated {} {}", run_id, status.as_str()));
            Ok(())
        }
    }

    fn request() -> EvaluationRequest {
        serde_json::from_value(serde_json::json!({
            "experiment_name": "nightly",
            "evaluations": [{
                "name": "e",
                "model_name": "llama",
                "model_url": "http://m",
                "backends": []
            }]
        }))
        .unwrap()
    }

    fn result(request: &EvaluationRequest) -> EvaluationResult {
        let mut metrics = HashMap::new();
        metrics.insert("acc norm,none".to_string(), MetricValue::Float(0.5));
        metrics.insert("alias".to_string(), MetricValue::Text("arc".into()));
        let mut artifacts = HashMap::new();
        artifacts.insert("results".to_string(), "/tmp/r.json".to_string());
        EvaluationResult::completed(
            request.evaluations[0].id,
            "harness",
            "arc",
            chrono::Utc::now(),
        )
        .with_metrics(metrics)
        .with_artifacts(artifacts)
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("acc,none"), "acc_none");
        assert_eq!(sanitize_name("exact match"), "exact_match");
        assert_eq!(sanitize_name("plain"), "plain");
    }

    #[test]
    fn test_experiment_name_defaults_to_request_id() {
        let mut req = request();
        assert_eq!(ResultReporter::experiment_name(&req), "nightly");
        req.experiment_name = None;
        assert_eq!(
            ResultReporter::experiment_name(&req),
            format!("eval-hub-{}", req.request_id)
        );
    }

    #[tokio::test]
    async fn test_report_logs_run_and_tags_result() {
        let sink = Arc::new(FakeSink::default());
        let reporter = ResultReporter::new(sink.clone());
        let req = request();

        let out = reporter.report(&req, vec![result(&req)]).await;
        assert_eq!(out[0].tracking_run_id.as_deref(), Some("run-1"));

        let calls = sink.calls.lock();
        assert_eq!(calls[0], "experiment nightly");
        assert_eq!(calls[1], "run exp-1 http://m::llama_harness_arc");
        assert!(calls.contains(&"metric run-1 acc_norm_none=0.5".to_string()));
        assert!(!calls.iter().any(|c| c.contains("alias")));
        assert!(calls.contains(&"param run-1 status=completed".to_string()));
        assert!(calls.contains(&"artifact run-1 results=/tmp/r.json".to_string()));
        assert_eq!(calls.last().unwrap(), "terminated run-1 FINISHED");
    }

    #[tokio::test]
    async fn test_failed_result_terminates_run_as_failed() {
        let sink = Arc::new(FakeSink::default());
        let reporter = ResultReporter::new(sink.clone());
        let req = request();
        let failed = EvaluationResult::failed_immediately(req.evaluations[0].id, "h", "arc", "boom");

        reporter.report(&req, vec![failed]).await;
        let calls = sink.calls.lock();
        assert!(calls.contains(&"param run-1 error_message=boom".to_string()));
        assert_eq!(calls.last().unwrap(), "terminated run-1 FAILED");
    }

    #[tokio::test]
    async fn test_sink_failures_only_warn() {
        let req = request();

        let down = Arc::new(FakeSink {
            fail_experiment: true,
            ..Default::default()
        });
        let out = ResultReporter::new(down).report(&req, vec![result(&req)]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, EvaluationStatus::Completed);
        assert!(out[0].tracking_run_id.is_none());

        let flaky = Arc::new(FakeSink {
            fail_metrics: true,
            ..Default::default()
        });
        let out = ResultReporter::new(flaky).report(&req, vec![result(&req)]).await;
        assert!(out[0].tracking_run_id.is_none());
        assert!(out[0].is_success());
    }

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    async fn record(State(seen): State<Seen>, path: &'static str, body: Value) {
        seen.lock().push((path.to_string(), body));
    }

    #[tokio::test]
    async fn test_mlflow_client_rest_calls() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/api/2.0/mlflow/experiments/get-by-name",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("experiment_name").map(String::as_str) == Some("known") {
                        (
                            StatusCode::OK,
                            Json(serde_json::json!({"experiment": {"experiment_id": "7"}})),
                        )
                    } else {
                        (
                            StatusCode::NOT_FOUND,
                            Json(serde_json::json!({"error_code": "RESOURCE_DOES_NOT_EXIST"})),
                        )
                    }
                }),
            )
            .route(
                "/api/2.0/mlflow/experiments/create",
                post(|s: State<Seen>, Json(b): Json<Value>| async move {
                    record(s, "experiments/create", b).await;
                    Json(serde_json::json!({"experiment_id": "9"}))
                }),
            )
            .route(
                "/api/2.0/mlflow/runs/create",
                post(|s: State<Seen>, Json(b): Json<Value>| async move {
                    record(s, "runs/create", b).await;
                    Json(serde_json::json!({"run": {"info": {"run_id": "r1"}}}))
                }),
            )
            .route(
                "/api/2.0/mlflow/runs/log-metric",
                post(|s: State<Seen>, Json(b): Json<Value>| async move {
                    record(s, "runs/log-metric", b).await;
                    Json(serde_json::json!({}))
                }),
            )
            .route(
                "/api/2.0/mlflow/runs/update",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "db locked") }),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = MlflowClient::new(&format!("http://{}/", addr)).unwrap();
        assert_eq!(
            client.experiment_url("9"),
            Some(format!("http://{}/#/experiments/9", addr))
        );
        assert_eq!(FakeSink::default().experiment_url("9"), None);

        assert_eq!(client.create_experiment("known", &[]).await.unwrap(), "7");
        let tags = vec![("team".to_string(), "evals".to_string())];
        assert_eq!(client.create_experiment("fresh", &tags).await.unwrap(), "9");
        assert_eq!(client.create_run("9", "run", &[]).await.unwrap(), "r1");
        assert_ok!(client.log_metric("r1", "acc", 0.75).await);

        let err = assert_err!(client.set_terminated("r1", RunStatus::Finished).await);
        assert!(err.to_string().contains("500"));

        let seen = seen.lock();
        assert_eq!(seen[0].0, "experiments/create");
        assert_eq!(seen[0].1["tags"][0]["key"], "team");
        assert_eq!(seen[1].1["experiment_id"], "9");
        assert_eq!(seen[2].1["value"], 0.75);
    }
}
