use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SharedConfig, load_config};
use crate::record::now_millis;
use crate::store::{BlobStore, LogStore};

const TICK: Duration = Duration::from_secs(60);
const PURGE_EVERY: Duration = Duration::from_secs(6 * 60 * 60);
const GC_EVERY: Duration = Duration::from_secs(24 * 60 * 60);
/// Young blobs are spared: a just-written object's log row may still be in
/// the queue, so deleting it would race the save.
const GC_MIN_AGE: Duration = Duration::from_secs(60 * 60);

fn due(last: Option<Instant>, every: Duration) -> bool {
    last.is_none_or(|t| t.elapsed() >= every)
}

/// Periodic maintenance: log purge, blob garbage collection, and picking up
/// on-disk config edits. Errors are logged and the loop keeps going; a stop
/// signal ends it promptly.
pub fn spawn(
    db: Arc<LogStore>,
    blobs: Arc<BlobStore>,
    config: Arc<SharedConfig>,
    config_path: PathBuf,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_purge: Option<Instant> = None;
        let mut last_gc: Option<Instant> = None;
        let mut last_config_mtime: Option<SystemTime> = None;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(TICK) => {}
            }

            // Hand edited configs take effect without a restart; in-flight
            // requests keep the snapshot they started with.
            let mtime = tokio::fs::metadata(&config_path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            if mtime.is_some() && mtime != last_config_mtime {
                if last_config_mtime.is_some() {
                    match load_config(&config_path).await {
                        Ok(cfg) => {
                            config.replace(cfg).await;
                            info!("reloaded config from {}", config_path.display());
                        }
                        Err(err) => warn!("config reload failed, keeping current: {err}"),
                    }
                }
                last_config_mtime = mtime;
            }

            let retention_days = config.snapshot().await.storage.retention_days;
            if retention_days > 0 && due(last_purge, PURGE_EVERY) {
                last_purge = Some(Instant::now());
                let cutoff = now_millis() - i64::from(retention_days) * 24 * 60 * 60 * 1000;
                let db = db.clone();
                let purged =
                    tokio::task::spawn_blocking(move || db.delete_before(cutoff)).await;
                match purged {
                    Ok(Ok(0)) => debug!("retention purge: nothing to delete"),
                    Ok(Ok(n)) => info!("retention purge removed {n} records"),
                    Ok(Err(err)) => warn!("retention purge failed: {err}"),
                    Err(err) => warn!("retention purge task failed: {err}"),
                }
            }

            if due(last_gc, GC_EVERY) {
                last_gc = Some(Instant::now());
                let db = db.clone();
                let blobs = blobs.clone();
                let collected = tokio::task::spawn_blocking(move || {
                    let refs = db.list_blob_refs()?;
                    blobs.garbage_collect(&refs, GC_MIN_AGE)
                })
                .await;
                match collected {
                    Ok(Ok(0)) => debug!("blob gc: nothing unreferenced"),
                    Ok(Ok(n)) => info!("blob gc removed {n} objects"),
                    Ok(Err(err)) => warn!("blob gc failed: {err}"),
                    Err(err) => warn!("blob gc task failed: {err}"),
                }
            }
        }
        debug!("retention loop stopped");
    })
}
