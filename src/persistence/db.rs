//! Database access layer (C7): bulk idempotent writes and a liveness probe.
//! Grounded on `database_operations.py`'s `pg_copy_batch`/`test_database_connection`,
//! adapted from asyncpg COPY + manual retry to a single `sqlx` batched `INSERT ...
//! ON CONFLICT DO NOTHING`, since conflict handling inside a COPY isn't expressible
//! and the crate's retry/backoff already lives in [`crate::router`].

use crate::backoff::Backoff;
use crate::model::Token;
use async_trait::async_trait;
use std::time::Duration;

/// Errors a [`DatabaseOps`] implementation can raise. `Unavailable` triggers the
/// WAL fallback; `Fatal` bubbles all the way up as a persistence failure (disk full
/// on the database's own storage, a schema mismatch, anything retrying can't fix).
#[derive(Debug, Clone)]
pub enum DbError {
    Unavailable(String),
    Fatal(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(m) => write!(f, "database unavailable: {m}"),
            Self::Fatal(m) => write!(f, "fatal database error: {m}"),
        }
    }
}

impl std::error::Error for DbError {}

/// The persistence layer's database seam. `copy_batch` must be idempotent under
/// retry (duplicate rows from a WAL replay after a partial write are expected and
/// silently ignored via `ON CONFLICT DO NOTHING`).
#[async_trait]
pub trait DatabaseOps: Send + Sync {
    async fn copy_batch(&self, tokens: &[Token]) -> Result<(), DbError>;

    /// Cheap liveness probe used by the replay loop's `db_is_up()` check.
    async fn ping(&self) -> bool;
}

/// `sqlx`-backed Postgres implementation of [`DatabaseOps`].
pub struct PgDatabase {
    pool: sqlx::PgPool,
}

impl PgDatabase {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new().max_connections(10).connect(database_url).await?;
        Ok(Self { pool })
    }
}

const MAX_COPY_RETRIES: usize = 3;

#[async_trait]
impl DatabaseOps for PgDatabase {
    /// Mirrors `database_operations.py`'s retry loop around the COPY: up to
    /// [`MAX_COPY_RETRIES`] attempts with `min(2^attempt, 10s)` backoff before giving
    /// up and letting the caller fall back to the WAL.
    async fn copy_batch(&self, tokens: &[Token]) -> Result<(), DbError> {
        if tokens.is_empty() {
            return Ok(());
        }

        let backoff = Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(10));
        let mut last_error = None;

        for attempt in 1..=MAX_COPY_RETRIES {
            match self.try_copy_once(tokens).await {
                Ok(()) => return Ok(()),
                Err(DbError::Fatal(message)) => return Err(DbError::Fatal(message)),
                Err(e @ DbError::Unavailable(_)) => {
                    last_error = Some(e);
                    if attempt < MAX_COPY_RETRIES {
                        tokio::time::sleep(backoff.delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DbError::Unavailable("pg_copy exhausted retries".into())))
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

impl PgDatabase {
    async fn try_copy_once(&self, tokens: &[Token]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        sqlx::query("SET LOCAL synchronous_commit = on").execute(&mut *tx).await.map_err(classify_sqlx_error)?;

        for token in tokens {
            let ts = chrono::DateTime::from_timestamp_millis(token.timestamp_ms as i64).unwrap_or_else(chrono::Utc::now);
            sqlx::query(
                "INSERT INTO llm_token_log (request_id, attempt_seq, token_index, model_id, token_text, ts) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (request_id, attempt_seq, token_index) DO NOTHING",
            )
            .bind(&token.request_id)
            .bind(token.attempt_seq as i32)
            .bind(token.index as i64)
            .bind(&token.model_id)
            .bind(&token.text)
            .bind(ts)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
        }

        tx.commit().await.map_err(classify_sqlx_error)
    }
}

fn classify_sqlx_error(error: sqlx::Error) -> DbError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("no space left") || lower.contains("disk full") {
        DbError::Fatal(message)
    } else {
        DbError::Unavailable(message)
    }
}

/// Scriptable in-memory [`DatabaseOps`] for tests: can be toggled up/down, or made
/// to fail a fixed number of times before recovering.
pub struct FakeDatabase {
    state: tokio::sync::Mutex<FakeState>,
}

struct FakeState {
    up: bool,
    fail_next_n: usize,
    committed: Vec<Token>,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self { state: tokio::sync::Mutex::new(FakeState { up: true, fail_next_n: 0, committed: Vec::new() }) }
    }
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_up(&self, up: bool) {
        self.state.lock().await.up = up;
    }

    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.fail_next_n = n;
    }

    pub async fn committed_tokens(&self) -> Vec<Token> {
        self.state.lock().await.committed.clone()
    }
}

#[async_trait]
impl DatabaseOps for FakeDatabase {
    async fn copy_batch(&self, tokens: &[Token]) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        if !state.up {
            return Err(DbError::Unavailable("fake database is down".into()));
        }
        if state.fail_next_n > 0 {
            state.fail_next_n -= 1;
            return Err(DbError::Unavailable("scripted failure".into()));
        }
        for token in tokens {
            if !state.committed.iter().any(|t| t.request_id == token.request_id && t.attempt_seq == token.attempt_seq && t.index == token.index) {
                state.committed.push(token.clone());
            }
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.state.lock().await.up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(i: u64) -> Token {
        Token { request_id: "req-1".into(), attempt_seq: 1, index: i, model_id: "gpt-4".into(), text: format!("c{i}"), timestamp_ms: 0 }
    }

    #[tokio::test]
    async fn fake_commits_tokens_when_up() {
        let db = FakeDatabase::new();
        db.copy_batch(&[token(0), token(1)]).await.unwrap();
        assert_eq!(db.committed_tokens().await.len(), 2);
    }

    #[tokio::test]
    async fn fake_rejects_writes_when_down() {
        let db = FakeDatabase::new();
        db.set_up(false).await;
        assert!(matches!(db.copy_batch(&[token(0)]).await, Err(DbError::Unavailable(_))));
        assert!(!db.ping().await);
    }

    #[tokio::test]
    async fn fake_ignores_duplicate_inserts() {
        let db = FakeDatabase::new();
        db.copy_batch(&[token(0)]).await.unwrap();
        db.copy_batch(&[token(0)]).await.unwrap();
        assert_eq!(db.committed_tokens().await.len(), 1);
    }

    #[tokio::test]
    async fn fake_can_script_transient_failures() {
        let db = FakeDatabase::new();
        db.fail_next(2).await;
        assert!(db.copy_batch(&[token(0)]).await.is_err());
        assert!(db.copy_batch(&[token(0)]).await.is_err());
        assert!(db.copy_batch(&[token(0)]).await.is_ok());
    }
}
