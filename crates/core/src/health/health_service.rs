use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::debug;

use super::health_model::{ConnectivityStatus, SyncStatus};
use crate::config::SyncConfiguration;
use crate::conflicts::ConflictStatus;
use crate::errors::{Error, Result};
use crate::ledger::SyncLedgerTrait;
use crate::records::{ExternalEventClientTrait, InternalRecordClientTrait};

/// Aggregates ledger counts and connectivity probes. Performs no mutation.
pub struct HealthReporter {
    external: Arc<dyn ExternalEventClientTrait>,
    internal: Arc<dyn InternalRecordClientTrait>,
    ledger: Arc<dyn SyncLedgerTrait>,
}

impl HealthReporter {
    pub fn new(
        external: Arc<dyn ExternalEventClientTrait>,
        internal: Arc<dyn InternalRecordClientTrait>,
        ledger: Arc<dyn SyncLedgerTrait>,
    ) -> Self {
        Self {
            external,
            internal,
            ledger,
        }
    }

    /// `scheduled_next` is the scheduler's planned run, if it has one; otherwise
    /// the next run is derived from the last batch and the interval.
    pub async fn status(
        &self,
        config: &SyncConfiguration,
        batch_in_progress: bool,
        scheduled_next: Option<DateTime<Utc>>,
    ) -> Result<SyncStatus> {
        let timeout = config.request_timeout();
        let (system_a, system_b) = tokio::join!(
            probe(timeout, self.external.ping()),
            probe(timeout, self.internal.ping())
        );

        let counts = self.ledger.operation_counts()?;
        let unresolved_conflicts = self
            .ledger
            .list_conflicts(None)?
            .iter()
            .filter(|c| c.status != ConflictStatus::Resolved)
            .count();
        let last_run = self.ledger.last_batch_run()?;
        let last_sync_at = last_run
            .as_ref()
            .map(|run| run.finished_at.unwrap_or(run.started_at));

        let next_sync_at = if !config.auto_sync_enabled {
            None
        } else {
            scheduled_next.or_else(|| {
                let interval = chrono::Duration::seconds(config.sync_interval_secs as i64);
                last_sync_at.map(|at| at + interval)
            })
        };

        Ok(SyncStatus {
            organization_id: config.organization_id.clone(),
            direction: config.direction,
            auto_sync_enabled: config.auto_sync_enabled,
            system_a,
            system_b,
            batch_in_progress,
            last_sync_at,
            last_sync_status: last_run.map(|run| run.status),
            next_sync_at,
            pending_operations: counts.pending,
            failed_operations: counts.failed,
            conflicted_operations: counts.conflicted,
            unresolved_conflicts,
            checked_at: Utc::now(),
        })
    }
}

async fn probe<F>(timeout: std::time::Duration, ping: F) -> ConnectivityStatus
where
    F: Future<Output = Result<()>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, ping).await {
        Ok(result) => result,
        Err(_) => Err(Error::connection(format!(
            "probe timed out after {}ms",
            timeout.as_millis()
        ))),
    };
    let latency_ms = started.elapsed().as_millis() as i64;
    match result {
        Ok(()) => ConnectivityStatus {
            connected: true,
            latency_ms,
            error: None,
        },
        Err(err) => {
            debug!("[EventSync] Connectivity probe failed: {}", err);
            ConnectivityStatus {
                connected: false,
                latency_ms,
                error: Some(err.to_string()),
            }
        }
    }
}
