mod cleanup;
mod config;
mod error;
mod executor;
mod handlers;
mod kube;
mod metrics;
mod models;
mod orchestrator;
mod process;
mod progress;
mod response;
mod tasks;
mod tracking;
mod ws;

use anyhow::Context;
use dashmap::DashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::kube::{ControlPlane, KubeClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("eval_hub=info".parse()?),
        )
        .init();

    let config = Arc::new(config::Config::from_env());
    config.print_banner();

    let control_plane: Option<Arc<dyn ControlPlane>> = if config.deploy_crs {
        match KubeClient::from_config(&config) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Kubernetes API unavailable, harness runs locally: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let jobs = control_plane
        .clone()
        .map(|cp| {
            Arc::new(executor::lmeval::LmEvalExecutor::new(
                &models::BackendConfig::new(),
                &config,
                Some(cp),
            ))
        })
        .filter(|jobs| jobs.deploys_crs());

    let registry = Arc::new(executor::ExecutorRegistry::with_defaults(
        config.clone(),
        control_plane,
    ));
    let metrics_store = metrics::Metrics::new();
    let orchestrator =
        orchestrator::EvaluationExecutor::new(&config, registry.clone(), metrics_store.clone());

    let reporter = match config.mlflow_tracking_uri.as_deref() {
        Some(uri) => match tracking::MlflowClient::new(uri) {
            Ok(client) => Some(Arc::new(tracking::ResultReporter::new(Arc::new(client)))),
            Err(e) => {
                warn!("Tracking disabled: {:#}", e);
                None
            }
        },
        None => None,
    };

    let state = Arc::new(handlers::AppState {
        config: config.clone(),
        orchestrator: orchestrator.clone(),
        metrics: metrics_store,
        progress: progress::ProgressFeed::new(),
        reporter,
        requests: DashMap::new(),
        backends: registry.describe_backends(),
        jobs,
        started_at: chrono::Utc::now(),
    });

    let app = handlers::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());
    let addr = format!("0.0.0.0:{}", config.port);

    // Finished-evaluation reaper
    tokio::spawn(orchestrator.tasks().reaper_loop());

    // Finished-request reaper
    tokio::spawn(state.reaper_loop());

    // Stale harness output reaper
    tokio::spawn(cleanup::reaper_loop(
        config.lmeval_output_path.clone(),
        config.task_retention_secs,
    ));

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, draining...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
