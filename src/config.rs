use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_CONCURRENT: usize = 10;
const DEFAULT_TIMEOUT_MINUTES: u64 = 60;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_OUTPUT_PATH: &str = "/tmp/lmeval_results";
const DEFAULT_TASK_RETENTION_SECS: u64 = 3600;
const DEFAULT_SIMULATION_SPEED: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_concurrent_evaluations: usize,
    pub default_timeout_minutes: u64,
    pub default_retry_attempts: u32,
    pub namespace: String,
    pub poll_interval_secs: u64,
    pub deploy_crs: bool,
    pub kube_api_url: Option<String>,
    pub lmeval_output_path: PathBuf,
    pub mlflow_tracking_uri: Option<String>,
    pub task_retention_secs: u64,
    pub simulation_speed: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_concurrent_evaluations: DEFAULT_MAX_CONCURRENT,
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            default_retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            namespace: DEFAULT_NAMESPACE.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            deploy_crs: true,
            kube_api_url: None,
            lmeval_output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            mlflow_tracking_uri: None,
            task_retention_secs: DEFAULT_TASK_RETENTION_SECS,
            simulation_speed: DEFAULT_SIMULATION_SPEED,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            max_concurrent_evaluations: env_parse(
                "MAX_CONCURRENT_EVALUATIONS",
                DEFAULT_MAX_CONCURRENT,
            )
            .max(1),
            default_timeout_minutes: env_parse("DEFAULT_TIMEOUT_MINUTES", DEFAULT_TIMEOUT_MINUTES),
            default_retry_attempts: env_parse("DEFAULT_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS),
            namespace: std::env::var("K8S_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.into()),
            poll_interval_secs: env_parse("CR_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS),
            deploy_crs: env_parse("DEPLOY_CRS", true),
            kube_api_url: std::env::var("KUBE_API_URL").ok(),
            lmeval_output_path: PathBuf::from(
                std::env::var("LMEVAL_OUTPUT_PATH").unwrap_or_else(|_| DEFAULT_OUTPUT_PATH.into()),
            ),
            mlflow_tracking_uri: std::env::var("MLFLOW_TRACKING_URI").ok(),
            task_retention_secs: env_parse("TASK_RETENTION_SECS", DEFAULT_TASK_RETENTION_SECS),
            simulation_speed: env_parse("SIMULATION_SPEED", DEFAULT_SIMULATION_SPEED),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║              eval-hub v{}                     ║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Port:              {:<28}║", self.port);
        tracing::info!("║  Max concurrent:    {:<28}║", self.max_concurrent_evaluations);
        tracing::info!("║  Default timeout:   {:<23}min ║", self.default_timeout_minutes);
        tracing::info!("║  Default retries:   {:<28}║", self.default_retry_attempts);
        tracing::info!("║  Namespace:         {:<28}║", self.namespace);
        tracing::info!("║  Poll interval:     {:<25}s ║", self.poll_interval_secs);
        tracing::info!("║  CR deployment:     {:<28}║", if self.deploy_crs { "enabled" } else { "disabled" });
        tracing::info!("║  Output path:       {:<28}║", self.lmeval_output_path.display());
        tracing::info!("║  Tracking:          {:<28}║", if self.mlflow_tracking_uri.is_some() { "mlflow" } else { "disabled" });
        tracing::info!("║  Task retention:    {:<25}s ║", self.task_retention_secs);
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
