use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::models::EvaluationSpec;

pub use crate::models::EvaluationStatus as TaskStatus;

const REAP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub evaluation_id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub model_name: String,
    pub backends: Vec<String>,
    pub progress: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct TaskStats {
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

impl TaskStats {
    fn new() -> Self {
        Self {
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }
}

/// Live view of evaluations, keyed by evaluation id.
///
/// Cancellation only flips the recorded status; running work is not interrupted.
/// Terminal entries are dropped by [`TaskTracker::reap_expired`] once they are
/// older than the retention window.
pub struct TaskTracker {
    tasks: DashMap<Uuid, TaskInfo>,
    retention: Duration,
    pub stats: TaskStats,
}

impl TaskTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            retention,
            stats: TaskStats::new(),
        }
    }

    pub fn start(&self, spec: &EvaluationSpec) -> TaskInfo {
        let now = Utc::now();
        let info = TaskInfo {
            evaluation_id: spec.id,
            name: spec.name.clone(),
            status: TaskStatus::Running,
            model_name: spec.model_name.clone(),
            backends: spec.backends.iter().map(|b| b.name.clone()).collect(),
            progress: 0.0,
            message: "Evaluation started".to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.tasks.insert(spec.id, info.clone());
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        info
    }

    /// Terminal entries keep their last progress.
    pub fn update_progress(&self, id: &Uuid, percent: f64, message: &str) {
        if let Some(mut task) = self.tasks.get_mut(id) {
            if task.status.is_terminal() {
                return;
            }
            task.progress = percent;
            task.message = message.to_string();
            task.updated_at = Utc::now();
        }
    }

    /// Record the outcome. A cancelled entry stays cancelled.
    pub fn finish(&self, id: &Uuid, status: TaskStatus) {
        let Some(mut task) = self.tasks.get_mut(id) else {
            return;
        };
        if task.status == TaskStatus::Cancelled {
            return;
        }
        let now = Utc::now();
        task.status = status;
        task.updated_at = now;
        task.completed_at = Some(now);
        if status == TaskStatus::Completed {
            task.progress = 100.0;
        }
        match status {
            TaskStatus::Completed => self.stats.completed.fetch_add(1, Ordering::Relaxed),
            TaskStatus::Failed => self.stats.failed.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    /// Mark a live evaluation cancelled. Unknown or already terminal ids return false.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let Some(mut task) = self.tasks.get_mut(id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        task.status = TaskStatus::Cancelled;
        task.message = "Cancellation requested".to_string();
        task.updated_at = now;
        task.completed_at = Some(now);
        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        info!(evaluation_id = %id, "Evaluation cancelled");
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<TaskInfo> {
        self.tasks.get(id).map(|t| t.value().clone())
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    pub fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let before = self.tasks.len();
        self.tasks.retain(|_, task| match task.completed_at {
            Some(done) if task.status.is_terminal() => now - done <= retention,
            _ => true,
        });
        let reaped = before.saturating_sub(self.tasks.len());
        if reaped > 0 {
            info!("Reaped {} finished evaluations", reaped);
        }
        reaped
    }

    pub async fn reaper_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(REAP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            self.reap_expired(Utc::now());
        }
    }
}
