//! Single writer thread. SQLite allows one writer at a time, so every mutation
//! is funneled through here and runs in its own immediate transaction.

use diesel::SqliteConnection;
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use eventsync_core::errors::{DatabaseError, Error};
use eventsync_core::Result;

use super::DbPool;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

#[derive(Clone)]
pub struct WriteHandle {
    sender: mpsc::UnboundedSender<Job>,
}

impl WriteHandle {
    /// Runs `job` on the writer thread inside a transaction. An `Err` from the
    /// job rolls back everything it wrote.
    pub async fn exec<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: Job = Box::new(move |conn: &mut SqliteConnection| {
            let result = conn
                .immediate_transaction::<T, StorageError, _>(|tx| {
                    job(tx).map_err(StorageError::Domain)
                })
                .map_err(Error::from);
            let _ = reply_tx.send(result);
        });
        self.sender.send(wrapped).map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Database writer has stopped".to_string(),
            ))
        })?;
        reply_rx.await.map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Database writer dropped the job".to_string(),
            ))
        })?
    }
}

/// Starts the writer thread. It runs until every `WriteHandle` is dropped.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
    let spawned = std::thread::Builder::new()
        .name("eventsync-db-writer".to_string())
        .spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                match pool.get() {
                    Ok(mut conn) => job(&mut *conn),
                    Err(err) => error!("[Ledger] Writer could not get a connection: {}", err),
                }
            }
            debug!("[Ledger] Writer stopped");
        });
    if let Err(err) = spawned {
        error!("[Ledger] Could not start the database writer: {}", err);
    }
    WriteHandle { sender }
}
