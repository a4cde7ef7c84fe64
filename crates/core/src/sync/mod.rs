//! Sync engine: batch orchestration, webhook ingestion and their shared pipeline.

mod batch_orchestrator;
mod record_locks;
mod record_pipeline;
mod sync_engine;
mod sync_events;
mod sync_retry;
mod sync_scheduler;
mod webhook_handler;
mod webhook_model;
mod webhook_queue;

pub use record_locks::*;
pub use sync_engine::*;
pub use sync_events::*;
pub use sync_retry::*;
pub use webhook_model::*;
pub use webhook_queue::*;

#[cfg(test)]
mod tests;
