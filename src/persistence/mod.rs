//! Persistence (C7): durably commits a batch of tokens, falling back to the WAL
//! when the database is unreachable, and replaying the WAL back to the database in
//! the background. Grounded on `persistence_service.py`'s batch algorithm:
//!
//! ```text
//! async def persist_batch(batch):
//!     try:
//!         await pg_copy(batch)
//!     except (asyncpg.PostgresError, OSError) as e:
//!         wal_write(batch)
//!         raise PersistenceDeferred(e)
//! ```

pub mod db;
pub mod replay;
pub mod wal;

pub use db::{DatabaseOps, DbError, FakeDatabase, PgDatabase};
pub use replay::ReplayLoop;
pub use wal::WalHandler;

use crate::error::{PersistenceError, PersistenceOutcome};
use crate::model::Token;
use crate::telemetry::{EventEmitter, NullSink, PersistenceEvent, RelayEvent};
use std::sync::Arc;

pub struct PersistenceService {
    wal: Arc<WalHandler>,
    db: Arc<dyn DatabaseOps>,
    telemetry: Arc<dyn EventEmitter>,
}

impl PersistenceService {
    pub fn new(wal: Arc<WalHandler>, db: Arc<dyn DatabaseOps>) -> Self {
        Self { wal, db, telemetry: Arc::new(NullSink) }
    }

    /// Same as [`Self::new`] but events (committed/deferred/failed) are emitted to
    /// `telemetry` as they occur, rather than discarded.
    pub fn with_telemetry(wal: Arc<WalHandler>, db: Arc<dyn DatabaseOps>, telemetry: Arc<dyn EventEmitter>) -> Self {
        Self { wal, db, telemetry }
    }

    pub fn wal(&self) -> &Arc<WalHandler> {
        &self.wal
    }

    pub fn database(&self) -> &Arc<dyn DatabaseOps> {
        &self.db
    }

    /// Try the database first; on failure, fall back to the WAL. Returns
    /// `Ok(Committed)` on a direct database write, `Ok(Deferred)` once the batch is
    /// safely on disk awaiting replay, and `Err` only when both the database and the
    /// WAL have failed — a fatal condition the caller must propagate.
    pub async fn persist_batch(&self, tokens: &[Token]) -> Result<PersistenceOutcome, PersistenceError> {
        if tokens.is_empty() {
            return Ok(PersistenceOutcome::Committed);
        }

        match self.db.copy_batch(tokens).await {
            Ok(()) => {
                self.telemetry.emit(RelayEvent::Persistence(PersistenceEvent::Committed { tokens: tokens.len() }));
                Ok(PersistenceOutcome::Committed)
            }
            Err(DbError::Fatal(message)) => {
                self.telemetry.emit(RelayEvent::Persistence(PersistenceEvent::Failed { reason: message.clone() }));
                Err(PersistenceError::Database { message })
            }
            Err(DbError::Unavailable(db_message)) => match self.wal.write_batch(tokens).await {
                Ok(()) => {
                    tracing::warn!(error = %db_message, tokens = tokens.len(), "database unavailable, deferred to wal");
                    self.telemetry.emit(RelayEvent::Persistence(PersistenceEvent::Deferred { tokens: tokens.len() }));
                    Ok(PersistenceOutcome::Deferred)
                }
                Err(wal_error) => {
                    tracing::error!(db_error = %db_message, wal_error = %wal_error, "persistence failure: database and wal both unavailable");
                    self.telemetry.emit(RelayEvent::Persistence(PersistenceEvent::Failed { reason: wal_error.to_string() }));
                    Err(wal_error)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(i: u64) -> Token {
        Token { request_id: "req-1".into(), attempt_seq: 1, index: i, model_id: "gpt-4".into(), text: format!("c{i}"), timestamp_ms: 0 }
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("llm-relay-persist-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn commits_directly_when_database_up() {
        let wal = Arc::new(WalHandler::new(tempdir().join("tokens.wal"), 100 * 1024 * 1024));
        let db: Arc<dyn DatabaseOps> = Arc::new(FakeDatabase::new());
        let service = PersistenceService::new(wal.clone(), db);

        let outcome = service.persist_batch(&[token(0)]).await.unwrap();
        assert_eq!(outcome, PersistenceOutcome::Committed);
        assert_eq!(wal.size_bytes().await, 0);
    }

    #[tokio::test]
    async fn defers_to_wal_when_database_down() {
        let wal = Arc::new(WalHandler::new(tempdir().join("tokens.wal"), 100 * 1024 * 1024));
        let fake = Arc::new(FakeDatabase::new());
        fake.set_up(false).await;
        let db: Arc<dyn DatabaseOps> = fake;
        let service = PersistenceService::new(wal.clone(), db);

        let outcome = service.persist_batch(&[token(0)]).await.unwrap();
        assert_eq!(outcome, PersistenceOutcome::Deferred);
        assert!(wal.size_bytes().await > 0);
    }

    #[tokio::test]
    async fn empty_batch_is_trivially_committed() {
        let wal = Arc::new(WalHandler::new(tempdir().join("tokens.wal"), 100 * 1024 * 1024));
        let db: Arc<dyn DatabaseOps> = Arc::new(FakeDatabase::new());
        let service = PersistenceService::new(wal, db);
        assert_eq!(service.persist_batch(&[]).await.unwrap(), PersistenceOutcome::Committed);
    }
}
