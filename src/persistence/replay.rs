//! Background WAL replay loop (C7): periodically drains the WAL into the database
//! once it's reachable again. Grounded on `wal_replay.py`'s `_replay_loop`.

use super::db::DatabaseOps;
use super::wal::WalHandler;
use crate::error::PersistenceError;
use crate::telemetry::{EventEmitter, NullSink, PersistenceEvent, RelayEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct ReplayStats {
    pub total_attempts: AtomicU64,
    pub successful_replays: AtomicU64,
    pub failed_replays: AtomicU64,
    pub tokens_replayed: AtomicU64,
}

pub struct ReplayLoop {
    wal: Arc<WalHandler>,
    db: Arc<dyn DatabaseOps>,
    interval: Duration,
    batch_size: usize,
    pub stats: Arc<ReplayStats>,
    telemetry: Arc<dyn EventEmitter>,
}

impl ReplayLoop {
    pub fn new(wal: Arc<WalHandler>, db: Arc<dyn DatabaseOps>, interval: Duration, batch_size: usize) -> Self {
        Self { wal, db, interval, batch_size, stats: Arc::new(ReplayStats::default()), telemetry: Arc::new(NullSink) }
    }

    /// Same as [`Self::new`] but emits [`PersistenceEvent::Replayed`] to `telemetry`
    /// after each successful cycle.
    pub fn with_telemetry(
        wal: Arc<WalHandler>,
        db: Arc<dyn DatabaseOps>,
        interval: Duration,
        batch_size: usize,
        telemetry: Arc<dyn EventEmitter>,
    ) -> Self {
        Self { wal, db, interval, batch_size, stats: Arc::new(ReplayStats::default()), telemetry }
    }

    /// Run the loop until `shutdown` fires. Each tick: if the database is up and the
    /// WAL has content, replay it in `batch_size` chunks and truncate on full success.
    /// A corrupted WAL line aborts that cycle without truncating — manual
    /// intervention is required rather than silently dropping unreplayable data.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn tick(&self) {
        self.stats.total_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.db.ping().await {
            tracing::debug!("database unavailable, skipping replay cycle");
            return;
        }

        // Held across the read/copy/truncate cycle so a concurrent `write_batch`
        // append can never land between the read and the truncate.
        let _guard = self.wal.lock_for_replay().await;

        let size = self.wal.size_bytes().await;
        if size == 0 {
            return;
        }

        match self.replay_all().await {
            Ok(0) => {}
            Ok(count) => {
                if let Err(e) = self.wal.truncate().await {
                    tracing::error!(error = %e, "failed to truncate wal after successful replay");
                    self.stats.failed_replays.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                self.stats.successful_replays.fetch_add(1, Ordering::SeqCst);
                self.stats.tokens_replayed.fetch_add(count as u64, Ordering::SeqCst);
                tracing::info!(tokens = count, "wal replay successful");
                self.telemetry.emit(RelayEvent::Persistence(PersistenceEvent::Replayed { tokens: count }));
            }
            Err(e) => {
                self.stats.failed_replays.fetch_add(1, Ordering::SeqCst);
                self.telemetry.emit(RelayEvent::Persistence(PersistenceEvent::Failed { reason: e.to_string() }));
                match e {
                    PersistenceError::WalCorruption { .. } => {
                        tracing::error!(error = %e, "wal corruption detected during replay, leaving file intact");
                    }
                    other => tracing::warn!(error = %other, "replay cycle failed"),
                }
            }
        }
    }

    async fn replay_all(&self) -> Result<usize, PersistenceError> {
        let tokens = self.wal.read_tokens().await?;
        let mut total = 0;
        for chunk in tokens.chunks(self.batch_size) {
            self.db.copy_batch(chunk).await.map_err(|e| PersistenceError::Database { message: e.to_string() })?;
            total += chunk.len();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::db::FakeDatabase;
    use crate::model::Token;

    fn token(i: u64) -> Token {
        Token { request_id: "req-1".into(), attempt_seq: 1, index: i, model_id: "gpt-4".into(), text: format!("c{i}"), timestamp_ms: 1_700_000_000_000 }
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("llm-relay-replay-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn skips_cycle_when_database_down() {
        let wal = Arc::new(WalHandler::new(tempdir().join("tokens.wal"), 100 * 1024 * 1024));
        wal.write_batch(&[token(0)]).await.unwrap();
        let db = Arc::new(FakeDatabase::new());
        db.set_up(false).await;

        let replay = ReplayLoop::new(wal.clone(), db.clone(), Duration::from_secs(10), 16);
        replay.tick().await;

        assert_eq!(replay.stats.successful_replays.load(Ordering::SeqCst), 0);
        assert!(wal.size_bytes().await > 0);
    }

    #[tokio::test]
    async fn replays_and_truncates_once_database_is_up() {
        let wal = Arc::new(WalHandler::new(tempdir().join("tokens.wal"), 100 * 1024 * 1024));
        wal.write_batch(&[token(0), token(1)]).await.unwrap();
        let db = Arc::new(FakeDatabase::new());

        let replay = ReplayLoop::new(wal.clone(), db.clone(), Duration::from_secs(10), 16);
        replay.tick().await;

        assert_eq!(replay.stats.successful_replays.load(Ordering::SeqCst), 1);
        assert_eq!(replay.stats.tokens_replayed.load(Ordering::SeqCst), 2);
        assert_eq!(wal.size_bytes().await, 0);
        assert_eq!(db.committed_tokens().await.len(), 2);
    }

    #[tokio::test]
    async fn empty_wal_is_a_no_op() {
        let wal = Arc::new(WalHandler::new(tempdir().join("tokens.wal"), 100 * 1024 * 1024));
        let db = Arc::new(FakeDatabase::new());
        let replay = ReplayLoop::new(wal, db, Duration::from_secs(10), 16);
        replay.tick().await;
        assert_eq!(replay.stats.total_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(replay.stats.successful_replays.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn corrupted_wal_is_left_intact_for_manual_intervention() {
        let dir = tempdir();
        let path = dir.join("tokens.wal");
        tokio::fs::write(&path, "not json\n").await.unwrap();
        let wal = Arc::new(WalHandler::new(path, 100 * 1024 * 1024));
        let db = Arc::new(FakeDatabase::new());

        let replay = ReplayLoop::new(wal.clone(), db, Duration::from_secs(10), 16);
        replay.tick().await;

        assert_eq!(replay.stats.failed_replays.load(Ordering::SeqCst), 1);
        assert!(wal.size_bytes().await > 0, "corrupt wal must not be truncated");
    }
}
