use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::EvaluationResult;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_active: AtomicU64,
    pub evaluations_total: AtomicU64,
    pub benchmark_runs_completed: AtomicU64,
    pub benchmark_runs_failed: AtomicU64,
    pub retries_total: AtomicU64,
    pub timeouts_total: AtomicU64,
    pub run_duration_sum_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn start_request(&self, evaluations: usize) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_add(1, Ordering::Relaxed);
        self.evaluations_total
            .fetch_add(evaluations as u64, Ordering::Relaxed);
    }

    pub fn finish_request(&self) {
        self.requests_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_result(&self, result: &EvaluationResult) {
        if result.is_success() {
            self.benchmark_runs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.benchmark_runs_failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(secs) = result.duration_seconds {
            self.run_duration_sum_ms
                .fetch_add((secs.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        format!(
            "# HELP eval_hub_requests_total Evaluation requests submitted.\n\
             # TYPE eval_hub_requests_total counter\n\
             eval_hub_requests_total {}\n\
             # HELP eval_hub_requests_active Requests currently executing.\n\
             # TYPE eval_hub_requests_active gauge\n\
             eval_hub_requests_active {}\n\
             # HELP eval_hub_evaluations_total Evaluations submitted.\n\
             # TYPE eval_hub_evaluations_total counter\n\
             eval_hub_evaluations_total {}\n\
             # HELP eval_hub_benchmark_runs_completed Benchmark runs that completed.\n\
             # TYPE eval_hub_benchmark_runs_completed counter\n\
             eval_hub_benchmark_runs_completed {}\n\
             # HELP eval_hub_benchmark_runs_failed Benchmark runs that failed.\n\
             # TYPE eval_hub_benchmark_runs_failed counter\n\
             eval_hub_benchmark_runs_failed {}\n\
             # HELP eval_hub_retries_total Benchmark attempts retried.\n\
             # TYPE eval_hub_retries_total counter\n\
             eval_hub_retries_total {}\n\
             # HELP eval_hub_timeouts_total Benchmark attempts that timed out.\n\
             # TYPE eval_hub_timeouts_total counter\n\
             eval_hub_timeouts_total {}\n\
             # HELP eval_hub_run_duration_ms_sum Sum of benchmark run durations in ms.\n\
             # TYPE eval_hub_run_duration_ms_sum counter\n\
             eval_hub_run_duration_ms_sum {}\n",
            load(&self.requests_total),
            load(&self.requests_active),
            load(&self.evaluations_total),
            load(&self.benchmark_runs_completed),
            load(&self.benchmark_runs_failed),
            load(&self.retries_total),
            load(&self.timeouts_total),
            load(&self.run_duration_sum_ms),
        )
    }
}
