//! Background timer driving scheduled batch passes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::sync_engine::SyncEngine;
use crate::ledger::{BatchStatus, SyncTrigger};

impl SyncEngine {
    /// Spawns the scheduler loop. It idles while auto-sync is disabled, wakes up
    /// on reconfiguration and stops on shutdown.
    pub(super) fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let config = engine.config().await;
                if !config.auto_sync_enabled {
                    engine.set_next_run(None);
                    debug!("[EventSync] Auto-sync disabled, scheduler idle");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = engine.reconfigured.notified() => continue,
                    }
                }

                let interval = Duration::from_secs(config.sync_interval_secs.max(1));
                engine.set_next_run(chrono::Duration::from_std(interval).ok().map(|d| Utc::now() + d));
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = engine.reconfigured.notified() => continue,
                    _ = tokio::time::sleep(interval) => {}
                }

                match engine.run_batch(SyncTrigger::Scheduled, None).await {
                    Ok(result) if result.status == BatchStatus::Coalesced => {
                        debug!("[EventSync] Scheduled batch coalesced into the running one");
                    }
                    Ok(result) => {
                        debug!(
                            "[EventSync] Scheduled batch finished status={} failed={}",
                            result.status.as_str(),
                            result.counts.failed
                        );
                    }
                    Err(err) => {
                        warn!("[EventSync] Scheduled batch failed: {}", err);
                    }
                }
            }
            engine.set_next_run(None);
            info!("[EventSync] Scheduler stopped");
        })
    }

    fn set_next_run(&self, next: Option<chrono::DateTime<Utc>>) {
        if let Ok(mut guard) = self.next_run_at.lock() {
            *guard = next;
        }
    }
}
