use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const REAP_INTERVAL_SECS: u64 = 300;

/// Remove a file or directory, logging instead of failing.
pub async fn remove_output(path: &Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!("Failed to cleanup {}: {}", path.display(), e);
    }
}

/// Delete harness output under `base` not modified for `max_age_secs`.
pub async fn reap_stale_outputs(base: &Path, max_age_secs: u64) -> usize {
    let mut entries = match tokio::fs::read_dir(base).await {
        Ok(e) => e,
        Err(_) => return 0,
    };

    let now = SystemTime::now();
    let mut reaped = 0;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age.as_secs() > max_age_secs {
            remove_output(&path).await;
            reaped += 1;
        }
    }

    if reaped > 0 {
        info!("Reaped {} stale harness outputs in {}", reaped, base.display());
    }
    reaped
}

pub async fn reaper_loop(base: std::path::PathBuf, max_age_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(REAP_INTERVAL_SECS));
    loop {
        interval.tick().await;
        reap_stale_outputs(&base, max_age_secs).await;
    }
}
