use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Record-scoped mutual exclusion shared by batch passes, webhooks and resolutions.
///
/// Entries are dropped once no task holds or waits on them.
#[derive(Debug, Default)]
pub struct RecordLocks {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a record is being reconciled.
pub struct RecordGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<RecordLocks>,
}

impl RecordLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Waits until no other task holds `key`.
    pub async fn lock(self: &Arc<Self>, key: impl Into<String>) -> RecordGuard {
        let key = key.into();
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = entry.lock_owned().await;
        RecordGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock key for a record pair, always derived from the external id when known.
pub fn external_key(external_id: &str) -> String {
    format!("a:{}", external_id)
}

/// Lock key for a System B record that has no link yet.
pub fn internal_key(internal_id: &str) -> String {
    format!("b:{}", internal_id)
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut entries = self.locks.entries.lock().unwrap_or_else(|e| e.into_inner());
        // The map holds one reference; any other means a holder or waiter remains.
        if let Some(entry) = entries.get(&self.key) {
            if Arc::strong_count(entry) == 1 {
                entries.remove(&self.key);
            }
        }
    }
}
