use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Synchronous progress hook: `(evaluation_id, percent, message)`.
///
/// Implementations must return promptly; executors call it inline at coarse
/// milestones and never await it.
pub type ProgressCallback = Arc<dyn Fn(&str, f64, &str) + Send + Sync>;

const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub evaluation_id: String,
    pub percent: f64,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Fan-out of progress events to any number of subscribers.
///
/// Backed by a bounded broadcast channel: publishing never blocks and a slow
/// subscriber loses the oldest events rather than stalling executors.
#[derive(Clone)]
pub struct ProgressFeed {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, evaluation_id: &str, percent: f64, message: &str) {
        // No subscribers is not an error.
        let _ = self.tx.send(ProgressEvent {
            evaluation_id: evaluation_id.to_string(),
            percent: clamp_percent(percent),
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    pub fn callback(&self) -> ProgressCallback {
        let feed = self.clone();
        Arc::new(move |id: &str, percent: f64, message: &str| {
            feed.publish(id, percent, message);
        })
    }
}

impl Default for ProgressFeed {
    fn default() -> Self {
        Self::new()
    }
}

pub fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Invoke an optional callback.
pub fn report(callback: Option<&ProgressCallback>, evaluation_id: &str, percent: f64, message: &str) {
    if let Some(cb) = callback {
        cb(evaluation_id, clamp_percent(percent), message);
    }
}
