use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ControlPlaneError;

pub const CR_GROUP: &str = "trustyai.opendatahub.io";
pub const CR_VERSION: &str = "v1alpha1";
pub const CR_PLURAL: &str = "lmevaljobs";
pub const CR_KIND: &str = "LMEvalJob";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LmEvalJob {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LmEvalJobSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LmEvalJobStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LmEvalJobSpec {
    pub model: String,
    pub task_list: TaskList,
    pub log_samples: bool,
    pub batch_size: String,
    pub allow_code_execution: bool,
    pub allow_online: bool,
    pub model_args: Vec<NameValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_fewshot: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    #[serde(default)]
    pub task_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodOverrides {
    pub container: ContainerOverrides,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerOverrides {
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub secret_key_ref: SecretKeySelector,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LmEvalJobStatus {
    pub state: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
    /// JSON document produced by the harness, stored as a string.
    pub results: Option<String>,
    pub progress_bars: Vec<ProgressBar>,
    pub complete_time: Option<String>,
    pub pod_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProgressBar {
    pub percent: Option<serde_json::Value>,
    pub message: Option<String>,
}

impl ProgressBar {
    /// Accepts `"45%"`, `"45"` or `45`; anything unparsable counts as zero.
    pub fn percent_value(&self) -> f64 {
        match &self.percent {
            Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(serde_json::Value::String(s)) => {
                s.trim().trim_end_matches('%').trim().parse().unwrap_or(0.0)
            }
            _ => 0.0,
        }
    }
}

/// Minimal view of the orchestration control plane used by the harness executor.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<LmEvalJob, ControlPlaneError>;

    async fn create(&self, namespace: &str, job: &LmEvalJob) -> Result<(), ControlPlaneError>;

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        job: &LmEvalJob,
    ) -> Result<(), ControlPlaneError>;
}

/// Kubernetes REST client for `LMEvalJob` custom resources.
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(base_url: &str, token: Option<String>, ca_pem: Option<&[u8]>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .context("Failed to parse cluster CA certificate")?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .context("Failed to build HTTP client for Kubernetes API")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Service-account credentials mounted into the pod.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST not set; not running in a cluster")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };
        Self::with_service_account(&format!("https://{}:{}", host, port))
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        match config.kube_api_url {
            Some(ref url) => Self::with_service_account(url),
            None => Self::in_cluster(),
        }
    }

    fn with_service_account(base_url: &str) -> Result<Self> {
        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(sa.join("token"))
            .ok()
            .map(|t| t.trim().to_string());
        let ca = std::fs::read(sa.join("ca.crt")).ok();
        info!(
            api = %base_url,
            token = token.is_some(),
            ca = ca.is_some(),
            "Configured Kubernetes API client"
        );
        Self::new(base_url, token, ca.as_deref())
    }

    fn collection_url(&self, namespace: &str) -> String {
        format!(
            "{}/apis/{}/{}/namespaces/{}/{}",
            self.base_url, CR_GROUP, CR_VERSION, namespace, CR_PLURAL
        )
    }

    fn resource_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_url(namespace), name)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(
        resp: reqwest::Response,
        name: &str,
    ) -> Result<reqwest::Response, ControlPlaneError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status.as_u16() {
            404 => Err(ControlPlaneError::NotFound(name.to_string())),
            409 => Err(ControlPlaneError::AlreadyExists(name.to_string())),
            code => {
                let body = resp.text().await.unwrap_or_default();
                let message = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                    .unwrap_or_else(|| body.chars().take(500).collect());
                Err(ControlPlaneError::Api {
                    status: code,
                    message,
                })
            }
        }
    }
}

fn transport(e: reqwest::Error) -> ControlPlaneError {
    ControlPlaneError::Transport(e.to_string())
}

#[async_trait]
impl ControlPlane for KubeClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<LmEvalJob, ControlPlaneError> {
        let url = self.resource_url(namespace, name);
        debug!("GET {}", url);
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp, name)
            .await?
            .json()
            .await
            .map_err(transport)
    }

    async fn create(&self, namespace: &str, job: &LmEvalJob) -> Result<(), ControlPlaneError> {
        let url = self.collection_url(namespace);
        debug!("POST {}", url);
        let resp = self
            .authorize(self.client.post(&url))
            .json(job)
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp, &job.metadata.name).await?;
        Ok(())
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        job: &LmEvalJob,
    ) -> Result<(), ControlPlaneError> {
        let url = self.resource_url(namespace, name);
        debug!("PATCH {}", url);
        let body = serde_json::to_vec(job).map_err(|e| ControlPlaneError::Transport(e.to_string()))?;
        let resp = self
            .authorize(self.client.patch(&url))
            .header("Content-Type", "application/merge-patch+json")
            .body(body)
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp, name).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path as AxumPath,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;

    fn sample_job(name: &str) -> LmEvalJob {
        LmEvalJob {
            api_version: format!("{}/{}", CR_GROUP, CR_VERSION),
            kind: CR_KIND.to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "evals".to_string(),
                labels: BTreeMap::new(),
            },
            spec: LmEvalJobSpec {
                model: "local-completions".into(),
                task_list: TaskList {
                    task_names: vec!["arc_easy".into()],
                },
                batch_size: "1".into(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let job = sample_job("lmeval-job-1");
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["apiVersion"], "trustyai.opendatahub.io/v1alpha1");
        assert_eq!(v["spec"]["taskList"]["taskNames"][0], "arc_easy");
        assert_eq!(v["spec"]["batchSize"], "1");
        assert!(v["spec"].get("limit").is_none());
        assert!(v.get("status").is_none());
    }

    #[test]
    fn test_status_deserializes_cluster_payload() {
        let status: LmEvalJobStatus = serde_json::from_value(json!({
            "state": "Running",
            "progressBars": [{"percent": "50%", "message": "Requesting API"}],
            "podName": "lmeval-pod",
            "unknownField": 1
        }))
        .unwrap();
        assert_eq!(status.state.as_deref(), Some("Running"));
        assert_eq!(status.progress_bars[0].percent_value(), 50.0);
        assert_eq!(status.pod_name.as_deref(), Some("lmeval-pod"));
    }

    #[test]
    fn test_progress_bar_percent_forms() {
        let bar = |v| ProgressBar {
            percent: Some(v),
            message: None,
        };
        assert_eq!(bar(json!("12.5%")).percent_value(), 12.5);
        assert_eq!(bar(json!(30)).percent_value(), 30.0);
        assert_eq!(bar(json!("n/a")).percent_value(), 0.0);
        assert_eq!(ProgressBar::default().percent_value(), 0.0);
    }

    #[test]
    fn test_resource_urls() {
        let client = KubeClient::new("https://kube.local:6443/", None, None).unwrap();
        assert_eq!(
            client.resource_url("evals", "job-1"),
            "https://kube.local:6443/apis/trustyai.opendatahub.io/v1alpha1/namespaces/evals/lmevaljobs/job-1"
        );
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_client_maps_http_statuses() {
        let app = Router::new()
            .route(
                "/apis/trustyai.opendatahub.io/v1alpha1/namespaces/:ns/lmevaljobs",
                post(|| async {
                    (
                        StatusCode::CONFLICT,
                        Json(json!({"message": "already exists"})),
                    )
                }),
            )
            .route(
                "/apis/trustyai.opendatahub.io/v1alpha1/namespaces/:ns/lmevaljobs/:name",
                get(|AxumPath((_ns, name)): AxumPath<(String, String)>| async move {
                    if name == "present" {
                        let mut job = sample_job("present");
                        job.status = Some(LmEvalJobStatus {
                            state: Some("Complete".into()),
                            reason: Some("Succeeded".into()),
                            ..Default::default()
                        });
                        Ok(Json(job))
                    } else if name == "broken" {
                        Err((
                            StatusCode::FORBIDDEN,
                            Json(json!({"message": "no access"})),
                        ))
                    } else {
                        Err((StatusCode::NOT_FOUND, Json(json!({"message": "missing"}))))
                    }
                })
                .patch(|| async { StatusCode::OK }),
            );
        let base = serve(app).await;
        let client = KubeClient::new(&base, Some("token".into()), None).unwrap();

        let job = client.get("evals", "present").await.unwrap();
        assert_eq!(
            job.status.unwrap().reason.as_deref(),
            Some("Succeeded")
        );

        assert!(matches!(
            client.get("evals", "absent").await,
            Err(ControlPlaneError::NotFound(_))
        ));
        match client.get("evals", "broken").await {
            Err(ControlPlaneError::Api { status, message }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "no access");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            client.create("evals", &sample_job("dup")).await,
            Err(ControlPlaneError::AlreadyExists(_))
        ));
        client
            .patch("evals", "present", &sample_job("present"))
            .await
            .unwrap();
    }
}
