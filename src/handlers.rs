use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::executor::lmeval::LmEvalExecutor;
use crate::executor::registry::BackendProfile;
use crate::kube::LmEvalJobStatus;
use crate::metrics::Metrics;
use crate::models::{EvaluationRequest, EvaluationResult};
use crate::orchestrator::EvaluationExecutor;
use crate::progress::ProgressFeed;
use crate::response::{build_summary, RequestSummary};
use crate::tasks::TaskInfo;
use crate::tracking::ResultReporter;
use crate::ws;

const REQUEST_REAP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub request_id: Uuid,
    pub evaluation_ids: Vec<Uuid>,
    pub phase: RequestPhase,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<EvaluationResult>,
}

pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: EvaluationExecutor,
    pub metrics: Arc<Metrics>,
    pub progress: ProgressFeed,
    pub reporter: Option<Arc<ResultReporter>>,
    pub requests: DashMap<Uuid, RequestRecord>,
    pub backends: Vec<BackendProfile>,
    /// Set only when LMEvalJob resources are deployed to a cluster.
    pub jobs: Option<Arc<LmEvalExecutor>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Drop finished requests older than the task retention window.
    pub fn reap_finished_requests(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(Duration::from_secs(
            self.config.task_retention_secs,
        ))
        .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let before = self.requests.len();
        self.requests.retain(|_, record| match record.finished_at {
            Some(done) if record.phase == RequestPhase::Finished => now - done <= retention,
            _ => true,
        });
        let reaped = before.saturating_sub(self.requests.len());
        if reaped > 0 {
            info!("Reaped {} finished requests", reaped);
        }
        reaped
    }

    pub async fn reaper_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(REQUEST_REAP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            self.reap_finished_requests(Utc::now());
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/api/v1/evaluations", post(submit).get(list_evaluations))
        .route("/api/v1/evaluations/:id", get(get_evaluation))
        .route("/api/v1/evaluations/:id/cancel", post(cancel_evaluation))
        .route("/api/v1/evaluations/:id/jobs", get(get_evaluation_jobs))
        .route("/api/v1/requests/:id", get(get_request))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: i64,
    active_evaluations: usize,
    requests_tracked: usize,
    capacity: usize,
    deploys_crs: bool,
    supported_backends: Vec<String>,
    backends: Vec<BackendProfile>,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
        active_evaluations: state.orchestrator.tasks().active_count(),
        requests_tracked: state.requests.len(),
        capacity: state.config.max_concurrent_evaluations,
        deploys_crs: state.jobs.as_ref().is_some_and(|j| j.deploys_crs()),
        supported_backends: state
            .backends
            .iter()
            .map(|b| b.backend_type.clone())
            .collect(),
        backends: state.backends.clone(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Fill per-evaluation timeout and retry budget from service defaults when absent.
fn apply_defaults(payload: &mut Value, config: &Config) {
    let Some(evaluations) = payload
        .get_mut("evaluations")
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for evaluation in evaluations.iter_mut().filter_map(Value::as_object_mut) {
        evaluation
            .entry("timeout_minutes")
            .or_insert_with(|| config.default_timeout_minutes.into());
        evaluation
            .entry("retry_attempts")
            .or_insert_with(|| config.default_retry_attempts.into());
    }
}

fn validate(request: &EvaluationRequest) -> Result<(), String> {
    if request.evaluations.is_empty() {
        return Err("evaluations must not be empty".to_string());
    }
    for evaluation in &request.evaluations {
        if evaluation.backends.is_empty() {
            return Err(format!(
                "evaluation {} has no backends",
                evaluation.name
            ));
        }
        if evaluation.model_name.trim().is_empty() {
            return Err(format!(
                "evaluation {} has no model_name",
                evaluation.name
            ));
        }
    }
    Ok(())
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Json(mut payload): Json<Value>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    apply_defaults(&mut payload, &state.config);
    let request: EvaluationRequest = serde_json::from_value(payload)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid request: {}", e)))?;
    validate(&request).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let request_id = request.request_id;
    if state.requests.contains_key(&request_id) {
        return Err((
            StatusCode::CONFLICT,
            format!("request {} already submitted", request_id),
        ));
    }

    let evaluation_ids: Vec<Uuid> = request.evaluations.iter().map(|e| e.id).collect();
    state.requests.insert(
        request_id,
        RequestRecord {
            request_id,
            evaluation_ids: evaluation_ids.clone(),
            phase: RequestPhase::Running,
            submitted_at: Utc::now(),
            finished_at: None,
            results: Vec::new(),
        },
    );
    state.metrics.start_request(request.evaluations.len());
    info!(
        request_id = %request_id,
        evaluations = evaluation_ids.len(),
        "Accepted evaluation request"
    );

    let worker = Arc::clone(&state);
    tokio::spawn(async move {
        let results = worker
            .orchestrator
            .execute_evaluation_request(request.evaluations.clone(), Some(worker.progress.callback()))
            .await;
        let results = match worker.reporter {
            Some(ref reporter) => reporter.report(&request, results).await,
            None => results,
        };

        match worker.requests.get_mut(&request_id) {
            Some(mut record) => {
                record.phase = RequestPhase::Finished;
                record.finished_at = Some(Utc::now());
                record.results = results;
            }
            None => warn!(request_id = %request_id, "Request record vanished before completion"),
        }
        worker.metrics.finish_request();
        info!(request_id = %request_id, "Evaluation request complete");
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "request_id": request_id,
            "evaluation_ids": evaluation_ids,
            "status": RequestPhase::Running,
        })),
    ))
}

async fn list_evaluations(State(state): State<Arc<AppState>>) -> Json<Vec<TaskInfo>> {
    Json(state.orchestrator.get_active_evaluations())
}

async fn get_evaluation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskInfo>, StatusCode> {
    state
        .orchestrator
        .get_evaluation_status(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn cancel_evaluation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if state.orchestrator.get_evaluation_status(&id).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("evaluation {} not found", id)));
    }
    if !state.orchestrator.cancel_evaluation(&id) {
        return Err((
            StatusCode::CONFLICT,
            format!("evaluation {} already finished", id),
        ));
    }
    Ok(Json(serde_json::json!({ "evaluation_id": id, "cancelled": true })))
}

#[derive(Debug, Serialize)]
struct JobView {
    backend_name: String,
    benchmark_name: String,
    cr_name: String,
    namespace: String,
    status: Option<LmEvalJobStatus>,
    results: Option<Value>,
}

/// `(backend, benchmark, cr_name, namespace)` for results produced by a deployed job.
fn job_ref(result: &EvaluationResult, default_namespace: &str) -> Option<(String, String, String, String)> {
    let metadata = result.metadata.as_ref()?;
    let cr_name = metadata.get("cr_name")?.as_str()?.to_string();
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or(default_namespace)
        .to_string();
    Some((
        result.backend_name.clone(),
        result.benchmark_name.clone(),
        cr_name,
        namespace,
    ))
}

/// Live LMEvalJob state for every job an evaluation deployed.
async fn get_evaluation_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let Some(jobs) = state.jobs.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "LMEvalJob deployment is disabled".to_string(),
        ));
    };

    let known = state.orchestrator.get_evaluation_status(&id).is_some()
        || state.requests.iter().any(|r| r.evaluation_ids.contains(&id));
    if !known {
        return Err((StatusCode::NOT_FOUND, format!("evaluation {} not found", id)));
    }

    let refs: Vec<_> = state
        .requests
        .iter()
        .flat_map(|record| {
            record
                .results
                .iter()
                .filter(|r| r.evaluation_id == id)
                .filter_map(|r| job_ref(r, jobs.namespace()))
                .collect::<Vec<_>>()
        })
        .collect();

    let mut views = Vec::with_capacity(refs.len());
    for (backend_name, benchmark_name, cr_name, namespace) in refs {
        let status = jobs.get_cr_status(&cr_name, Some(&namespace)).await;
        let results = jobs.get_cr_results(&cr_name, Some(&namespace)).await;
        views.push(JobView {
            backend_name,
            benchmark_name,
            cr_name,
            namespace,
            status,
            results,
        });
    }

    Ok(Json(serde_json::json!({
        "evaluation_id": id,
        "default_namespace": jobs.namespace(),
        "jobs": views,
    })))
}

#[derive(Serialize)]
struct RequestView {
    #[serde(flatten)]
    record: RequestRecord,
    summary: Option<RequestSummary>,
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RequestView>, StatusCode> {
    let record = state
        .requests
        .get(&id)
        .map(|r| r.value().clone())
        .ok_or(StatusCode::NOT_FOUND)?;
    let summary = match record.phase {
        RequestPhase::Finished => Some(build_summary(id, &record.results)),
        RequestPhase::Running => None,
    };
    Ok(Json(RequestView { record, summary }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        state_with_jobs(None)
    }

    fn state_with_jobs(jobs: Option<Arc<LmEvalExecutor>>) -> Arc<AppState> {
        let config = Arc::new(Config {
            simulation_speed: 0.0,
            default_retry_attempts: 0,
            ..Config::default()
        });
        let metrics = Metrics::new();
        let registry = Arc::new(ExecutorRegistry::new());
        Arc::new(AppState {
            orchestrator: EvaluationExecutor::new(&config, registry.clone(), metrics.clone()),
            backends: registry.describe_backends(),
            jobs,
            config,
            metrics,
            progress: ProgressFeed::new(),
            reporter: None,
            requests: DashMap::new(),
            started_at: Utc::now(),
        })
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let app = router(state());
        let (status, body) = call(app.clone(), get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(app, get_req("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_str().unwrap().contains("eval_hub_requests_total 0"));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_requests() {
        let app = router(state());
        let (status, _) = call(app.clone(), post_json("/api/v1/evaluations", json!({"evaluations": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            app,
            post_json(
                "/api/v1/evaluations",
                json!({"evaluations": [{"name": "e", "model_name": "m", "model_url": "u", "backends": []}]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.as_str().unwrap().contains("no backends"));
    }

    #[tokio::test]
    async fn test_submit_runs_in_background_and_reports_summary() {
        let state = state();
        let app = router(state.clone());
        let payload = json!({
            "evaluations": [{
                "name": "perf",
                "model_name": "llama",
                "model_url": "http://model:8000",
                "backends": [{
                    "name": "guide",
                    "type": "guidellm",
                    "benchmarks": [{"name": "load", "tasks": ["load"]}]
                }]
            }]
        });

        let (status, body) = call(app.clone(), post_json("/api/v1/evaluations", payload)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let request_id = body["request_id"].as_str().unwrap().to_string();
        let evaluation_id = body["evaluation_ids"][0].as_str().unwrap().to_string();

        let mut finished = Value::Null;
        for _ in 0..200 {
            let (status, body) =
                call(app.clone(), get_req(&format!("/api/v1/requests/{}", request_id))).await;
            assert_eq!(status, StatusCode::OK);
            if body["phase"] == "finished" {
                finished = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(finished["summary"]["state"], "completed");
        assert_eq!(finished["results"].as_array().unwrap().len(), 1);
        assert_eq!(finished["results"][0]["benchmark_name"], "load");

        let (status, body) = call(
            app.clone(),
            get_req(&format!("/api/v1/evaluations/{}", evaluation_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["evaluation_id"], evaluation_id);

        let (status, _) = call(
            app,
            post_json(&format!("/api/v1/evaluations/{}/cancel", evaluation_id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(state.metrics.requests_active.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let app = router(state());
        let id = Uuid::new_v4();
        let (status, _) = call(app.clone(), get_req(&format!("/api/v1/evaluations/{}", id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app.clone(), get_req(&format!("/api/v1/requests/{}", id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(
            app.clone(),
            post_json(&format!("/api/v1/evaluations/{}/cancel", id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app, get_req("/api/v1/evaluations/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_apply_defaults_only_fills_missing() {
        let config = Config {
            default_timeout_minutes: 15,
            default_retry_attempts: 1,
            ..Config::default()
        };
        let mut payload = json!({
            "evaluations": [
                {"name": "a"},
                {"name": "b", "timeout_minutes": 5, "retry_attempts": 0}
            ]
        });
        apply_defaults(&mut payload, &config);
        assert_eq!(payload["evaluations"][0]["timeout_minutes"], 15);
        assert_eq!(payload["evaluations"][0]["retry_attempts"], 1);
        assert_eq!(payload["evaluations"][1]["timeout_minutes"], 5);
        assert_eq!(payload["evaluations"][1]["retry_attempts"], 0);
    }

    #[tokio::test]
    async fn test_status_reports_backend_profiles() {
        let config = Arc::new(Config::default());
        let metrics = Metrics::new();
        let registry = Arc::new(ExecutorRegistry::with_defaults(config.clone(), None));
        let state = Arc::new(AppState {
            orchestrator: EvaluationExecutor::new(&config, registry.clone(), metrics.clone()),
            backends: registry.describe_backends(),
            jobs: None,
            config,
            metrics,
            progress: ProgressFeed::new(),
            reporter: None,
            requests: DashMap::new(),
            started_at: Utc::now(),
        });

        let (status, body) = call(router(state), get_req("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deploys_crs"], false);
        assert_eq!(body["supported_backends"], json!(["lm-evaluation-harness"]));
        assert_eq!(body["backends"][0]["recommended_timeout_minutes"], 60);
        assert_eq!(body["backends"][0]["max_retry_attempts"], 2);
    }

    #[tokio::test]
    async fn test_evaluation_jobs_reads_live_cr_state() {
        use crate::executor::job::JobTemplate;
        use crate::executor::testing;
        use crate::kube::fake::FakeControlPlane;
        use crate::models::{BackendConfig, BackendType, BenchmarkSpec};

        let cp = Arc::new(FakeControlPlane::with_statuses(vec![LmEvalJobStatus {
            state: Some("Complete".into()),
            reason: Some("Succeeded".into()),
            results: Some(r#"{"results": {"arc_easy": {"acc": 0.8}}}"#.into()),
            ..Default::default()
        }]));
        let mut backend_config = BackendConfig::new();
        backend_config.insert("namespace".into(), json!("evals"));
        let jobs = Arc::new(LmEvalExecutor::new(
            &backend_config,
            &Config::default(),
            Some(cp.clone()),
        ));
        let state = state_with_jobs(Some(jobs));
        let app = router(state.clone());

        let ctx = testing::context(
            BackendType::LmEvaluationHarness,
            BenchmarkSpec::new("arc_easy", vec!["arc_easy".into()]),
        );
        let template = JobTemplate {
            namespace: "evals".into(),
            ..Default::default()
        };
        let job = template.build(&ctx, &["arc_easy".to_string()], "m");
        let cr_name = job.metadata.name.clone();
        cp.jobs
            .lock()
            .insert(("evals".to_string(), cr_name.clone()), job);

        let result = EvaluationResult::completed(ctx.evaluation_id, "harness", "arc_easy", Utc::now())
            .with_metadata(json!({"cr_name": cr_name, "namespace": "evals"}));
        let plain = EvaluationResult::completed(ctx.evaluation_id, "perf", "load", Utc::now());
        state.requests.insert(
            Uuid::new_v4(),
            RequestRecord {
                request_id: Uuid::new_v4(),
                evaluation_ids: vec![ctx.evaluation_id],
                phase: RequestPhase::Finished,
                submitted_at: Utc::now(),
                finished_at: Some(Utc::now()),
                results: vec![result, plain],
            },
        );

        let (status, body) = call(
            app.clone(),
            get_req(&format!("/api/v1/evaluations/{}/jobs", ctx.evaluation_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["default_namespace"], "evals");
        let listed = body["jobs"].as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["cr_name"], cr_name.as_str());
        assert_eq!(listed[0]["status"]["reason"], "Succeeded");
        assert_eq!(listed[0]["results"]["results"]["arc_easy"]["acc"], 0.8);

        let (status, _) = call(
            app,
            get_req(&format!("/api/v1/evaluations/{}/jobs", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_evaluation_jobs_unavailable_without_cluster() {
        let (status, _) = call(
            router(state()),
            get_req(&format!("/api/v1/evaluations/{}/jobs", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_reap_finished_requests_after_retention() {
        let state = state();
        let record = |phase: RequestPhase, finished_at: Option<DateTime<Utc>>| RequestRecord {
            request_id: Uuid::new_v4(),
            evaluation_ids: Vec::new(),
            phase,
            submitted_at: Utc::now(),
            finished_at,
            results: Vec::new(),
        };
        let done = Uuid::new_v4();
        let running = Uuid::new_v4();
        state
            .requests
            .insert(done, record(RequestPhase::Finished, Some(Utc::now())));
        state.requests.insert(running, record(RequestPhase::Running, None));

        assert_eq!(state.reap_finished_requests(Utc::now()), 0);
        let later = Utc::now()
            + chrono::Duration::seconds(state.config.task_retention_secs as i64 + 1);
        assert_eq!(state.reap_finished_requests(later), 1);
        assert!(!state.requests.contains_key(&done));
        assert!(state.requests.contains_key(&running));
    }

}
