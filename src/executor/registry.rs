use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::custom::CustomHttpExecutor;
use super::lmeval::LmEvalExecutor;
use super::simulated::SimulatedExecutor;
use super::Executor;
use crate::config::Config;
use crate::error::ExecutorError;
use crate::kube::ControlPlane;
use crate::models::{BackendConfig, BackendType};

pub type ExecutorFactory =
    Arc<dyn Fn(&BackendConfig) -> Result<Box<dyn Executor>, ExecutorError> + Send + Sync>;

/// What a registered executor reports about itself with default settings.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendProfile {
    pub backend_type: String,
    pub display_name: String,
    pub supports_parallel_execution: bool,
    pub recommended_timeout_minutes: u64,
    pub max_retry_attempts: u32,
}

/// Backend type → executor constructor.
///
/// Built once at startup and shared by reference. Every `create_executor`
/// call builds a new instance so nothing carries over between runs.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    factories: HashMap<String, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the harness executor wired to `control_plane`.
    pub fn with_defaults(settings: Arc<Config>, control_plane: Option<Arc<dyn ControlPlane>>) -> Self {
        let mut registry = Self::new();
        registry.register(BackendType::LmEvaluationHarness.as_str(), move |config| {
            Ok(Box::new(LmEvalExecutor::new(
                config,
                &settings,
                control_plane.clone(),
            )))
        });
        registry
    }

    pub fn register<F>(&mut self, backend_type: &str, factory: F)
    where
        F: Fn(&BackendConfig) -> Result<Box<dyn Executor>, ExecutorError> + Send + Sync + 'static,
    {
        info!(backend_type = %backend_type, "Registered executor");
        self.factories
            .insert(backend_type.to_string(), Arc::new(factory));
    }

    pub fn is_backend_supported(&self, backend_type: &str) -> bool {
        self.factories.contains_key(backend_type)
    }

    pub fn supported_backends(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Profiles of every registered type that builds with an empty config.
    pub fn describe_backends(&self) -> Vec<BackendProfile> {
        let empty = BackendConfig::new();
        self.supported_backends()
            .into_iter()
            .filter_map(|backend_type| match self.create_executor(&backend_type, &empty) {
                Ok(executor) => Some(BackendProfile {
                    display_name: executor.display_name(),
                    supports_parallel_execution: executor.supports_parallel_execution(),
                    recommended_timeout_minutes: executor.recommended_timeout_minutes(),
                    max_retry_attempts: executor.max_retry_attempts(),
                    backend_type,
                }),
                Err(e) => {
                    warn!(backend_type = %backend_type, error = %e, "Executor needs configuration to describe");
                    None
                }
            })
            .collect()
    }

    /// Construct and validate a fresh executor.
    pub fn create_executor(
        &self,
        backend_type: &str,
        config: &BackendConfig,
    ) -> Result<Box<dyn Executor>, ExecutorError> {
        let factory = self
            .factories
            .get(backend_type)
            .ok_or_else(|| ExecutorError::UnsupportedBackend(backend_type.to_string()))?;
        let executor = factory(config)?;
        executor.validate_config()?;
        debug!(backend_type = %backend_type, executor = %executor.display_name(), "Created executor");
        Ok(executor)
    }
}

/// Built-in executor for a backend type nobody registered: simulated harness and
/// GuideLLM runs, and the generic HTTP client for everything else.
pub fn builtin_executor(
    backend_type: BackendType,
    config: &BackendConfig,
    simulation_speed: f64,
) -> Result<Box<dyn Executor>, ExecutorError> {
    let executor: Box<dyn Executor> = match backend_type {
        BackendType::LmEvaluationHarness | BackendType::GuideLlm => {
            Box::new(SimulatedExecutor::new(backend_type, simulation_speed)?)
        }
        BackendType::Custom => Box::new(CustomHttpExecutor::new(config)?),
    };
    executor.validate_config()?;
    Ok(executor)
}
