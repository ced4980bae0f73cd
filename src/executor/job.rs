//! `LMEvalJob` manifest construction.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use super::ExecutionContext;
use crate::kube::{
    ContainerOverrides, EnvVar, EnvVarSource, LmEvalJob, LmEvalJobSpec, NameValue, ObjectMeta,
    PodOverrides, SecretKeySelector, TaskList, CR_GROUP, CR_KIND, CR_VERSION,
};
use crate::models::BackendType;

pub const MAX_NAME_LEN: usize = 63;
const FALLBACK_NAME: &str = "evaljob";
const COMPLETIONS_SUFFIX: &str = "/v1/completions";

/// Coerce `name` into an RFC 1123 resource name.
///
/// Idempotent. Output is lowercase `[a-z0-9.-]`, at most 63 characters, and
/// starts and ends with an alphanumeric character.
pub fn sanitize_k8s_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    let mut name: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    // Truncation can expose a separator at the tail.
    while name.ends_with(['-', '.']) {
        name.pop();
    }

    if name.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    name
}

/// Strip a trailing slash and make sure the URL targets the completions route.
/// An empty input stays empty.
pub fn normalize_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.is_empty() {
        return String::new();
    }
    if base.ends_with(COMPLETIONS_SUFFIX) {
        base.to_string()
    } else {
        format!("{}{}", base, COMPLETIONS_SUFFIX)
    }
}

/// Ordered `name=value` list where the first write of a name wins.
#[derive(Debug, Default, Clone)]
pub struct ModelArgs(Vec<NameValue>);

impl ModelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|a| a.name == name)
    }

    /// Returns false when `name` was already present.
    pub fn insert_if_absent(&mut self, name: &str, value: impl Into<String>) -> bool {
        if self.contains(name) {
            return false;
        }
        self.0.push(NameValue {
            name: name.to_string(),
            value: value.into(),
        });
        true
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Accepts a JSON object or a string holding one; anything else is ignored.
    pub fn extend_from_value(&mut self, value: &Value) {
        match value {
            Value::Object(map) => {
                for (name, v) in map {
                    self.insert_if_absent(name, value_text(v));
                }
            }
            Value::String(s) if !s.is_empty() => {
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(s) {
                    for (name, v) in &map {
                        self.insert_if_absent(name, value_text(v));
                    }
                }
            }
            _ => {}
        }
    }

    pub fn into_vec(self) -> Vec<NameValue> {
        self.0
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Settings that shape the manifest, resolved by the executor from its backend config.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub namespace: String,
    pub cr_model: String,
    pub batch_size: String,
    pub log_samples: bool,
    pub limit: Option<i64>,
    pub num_fewshot: i64,
    pub model_args: Option<Value>,
    pub fallback_base_url: Option<String>,
    pub num_concurrent: String,
    pub max_retries: String,
    pub tokenized_requests: String,
    pub tokenizer: String,
    pub secret_name: Option<String>,
    pub secret_key: String,
}

impl Default for JobTemplate {
    fn default() -> Self {
        Self {
            namespace: "test".to_string(),
            cr_model: "local-completions".to_string(),
            batch_size: "1".to_string(),
            log_samples: true,
            limit: None,
            num_fewshot: 0,
            model_args: None,
            fallback_base_url: None,
            num_concurrent: "1".to_string(),
            max_retries: "3".to_string(),
            tokenized_requests: "False".to_string(),
            tokenizer: "google/flan-t5-base".to_string(),
            secret_name: None,
            secret_key: "token".to_string(),
        }
    }
}

impl JobTemplate {
    /// Model args: explicit overrides first, then the required defaults.
    pub fn model_args(&self, context: &ExecutionContext, model: &str) -> ModelArgs {
        let mut args = ModelArgs::new();
        if let Some(ref overrides) = self.model_args {
            args.extend_from_value(overrides);
        }

        args.insert_if_absent("model", model);

        if !args.contains("base_url") {
            let raw = if context.model_url.is_empty() {
                self.fallback_base_url.clone().unwrap_or_default()
            } else {
                context.model_url.clone()
            };
            let base_url = normalize_endpoint(&raw);
            if base_url.is_empty() {
                warn!(
                    evaluation_id = %context.evaluation_id,
                    model = %context.model_name,
                    "No base_url in context or backend config; leaving it empty in the CR"
                );
            } else {
                info!(
                    evaluation_id = %context.evaluation_id,
                    base_url = %base_url,
                    "Resolved model endpoint for CR"
                );
            }
            args.insert_if_absent("base_url", base_url);
        }

        args.insert_if_absent("num_concurrent", self.num_concurrent.clone());
        args.insert_if_absent("max_retries", self.max_retries.clone());
        args.insert_if_absent("tokenized_requests", self.tokenized_requests.clone());
        args.insert_if_absent("tokenizer", self.tokenizer.clone());
        args
    }

    /// Build a fresh manifest with a unique name for one run.
    pub fn build(&self, context: &ExecutionContext, tasks: &[String], model: &str) -> LmEvalJob {
        let benchmark = &context.benchmark_spec;

        let limit = benchmark
            .limit
            .or_else(|| super::config_i64(&benchmark.config, "limit"))
            .or(self.limit);
        let num_fewshot = benchmark
            .num_fewshot
            .or_else(|| super::config_i64(&benchmark.config, "num_fewshot"))
            .unwrap_or(self.num_fewshot);
        let batch_size = benchmark
            .batch_size
            .map(|b| b.to_string())
            .unwrap_or_else(|| self.batch_size.clone());

        let name = sanitize_k8s_name(&format!("lmeval-job-{}", Uuid::new_v4()));

        let mut labels = BTreeMap::new();
        labels.insert(
            "evaluation-id".to_string(),
            sanitize_k8s_name(&context.evaluation_key()),
        );
        labels.insert("benchmark".to_string(), sanitize_k8s_name(&benchmark.name));
        labels.insert("model".to_string(), sanitize_k8s_name(model));
        labels.insert(
            "backend".to_string(),
            BackendType::LmEvaluationHarness.as_str().to_string(),
        );

        let pod = self.secret_name.as_ref().map(|secret| PodOverrides {
            container: ContainerOverrides {
                env: vec![EnvVar {
                    name: "OPENAI_API_KEY".to_string(),
                    value: None,
                    value_from: Some(EnvVarSource {
                        secret_key_ref: SecretKeySelector {
                            name: secret.clone(),
                            key: self.secret_key.clone(),
                        },
                    }),
                }],
            },
        });

        LmEvalJob {
            api_version: format!("{}/{}", CR_GROUP, CR_VERSION),
            kind: CR_KIND.to_string(),
            metadata: ObjectMeta {
                name,
                namespace: self.namespace.clone(),
                labels,
            },
            spec: LmEvalJobSpec {
                model: self.cr_model.clone(),
                task_list: TaskList {
                    task_names: tasks.to_vec(),
                },
                log_samples: self.log_samples,
                batch_size,
                allow_code_execution: true,
                allow_online: true,
                model_args: self.model_args(context, model).into_vec(),
                pod,
                limit: limit.map(|l| l.to_string()),
                num_fewshot: Some(num_fewshot),
            },
            status: None,
        }
    }
}

pub fn to_yaml(job: &LmEvalJob) -> String {
    serde_yaml::to_string(job).unwrap_or_else(|e| format!("<unrenderable manifest: {}>", e))
}
