//! Application state and wiring of ledger, clients and engine.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use eventsync_connect::{SystemAClient, SystemBClient};
use eventsync_core::config::SyncConfiguration;
use eventsync_core::ledger::SyncLedgerTrait;
use eventsync_core::records::{ExternalEventClientTrait, InternalRecordClientTrait};
use eventsync_core::sync::{BroadcastSyncEventSink, SyncEngine};
use eventsync_storage_sqlite::db::{prepare_database_file, spawn_writer};
use eventsync_storage_sqlite::{create_pool, run_migrations, SqliteSyncLedger};

use crate::config::ServerConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub ledger: Arc<dyn SyncLedgerTrait>,
    pub events: BroadcastSyncEventSink,
}

impl AppState {
    /// Builds an engine over the given collaborators and starts its background tasks.
    pub async fn start(
        config: SyncConfiguration,
        external: Arc<dyn ExternalEventClientTrait>,
        internal: Arc<dyn InternalRecordClientTrait>,
        ledger: Arc<dyn SyncLedgerTrait>,
    ) -> anyhow::Result<Arc<Self>> {
        let events = BroadcastSyncEventSink::new(EVENT_CHANNEL_CAPACITY);
        let engine = Arc::new(
            SyncEngine::new(config, external, internal, Arc::clone(&ledger))?
                .with_event_sink(Arc::new(events.clone())),
        );
        engine.start().await;
        Ok(Arc::new(Self {
            engine,
            ledger,
            events,
        }))
    }
}

/// Opens the ledger, settles the effective configuration and starts the engine.
pub async fn build_state(server_config: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let db_path = server_config.database_path.as_str();
    prepare_database_file(db_path).context("Failed to prepare database directory")?;
    run_migrations(db_path).context("Failed to run migrations")?;
    let pool = create_pool(db_path).context("Failed to open database pool")?;
    let writer = spawn_writer(pool.as_ref().clone());
    let ledger: Arc<dyn SyncLedgerTrait> = Arc::new(SqliteSyncLedger::new(
        pool,
        writer,
        server_config.organization_id.clone(),
    ));

    // A configuration saved through the API outlives the environment defaults.
    let config = match ledger.load_configuration()? {
        Some(stored) => {
            info!(
                "Using persisted configuration for organization {}",
                stored.organization_id
            );
            stored
        }
        None => {
            let config = server_config.sync_configuration();
            config.validate()?;
            ledger.save_configuration(&config).await?;
            config
        }
    };

    let external: Arc<dyn ExternalEventClientTrait> = Arc::new(SystemAClient::from_config(&config)?);
    let internal: Arc<dyn InternalRecordClientTrait> = Arc::new(SystemBClient::from_config(&config)?);

    AppState::start(config, external, internal, ledger).await
}
