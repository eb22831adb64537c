//! WAL-Lite file format: one JSON object per line, rotated at a configurable size
//! threshold. Uses short field names (`r`/`a`/`i`/`m`/`t`/`ts`) to keep the on-disk
//! format compact.

use crate::error::PersistenceError;
use crate::model::Token;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Serialize, Deserialize)]
struct WalRecord {
    r: String,
    a: u32,
    i: u64,
    m: String,
    t: String,
    ts: String,
}

fn millis_to_iso(ms: u64) -> String {
    let dt: DateTime<Utc> = Utc.timestamp_millis_opt(ms as i64).single().unwrap_or_else(Utc::now);
    dt.to_rfc3339()
}

fn iso_to_millis(iso: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(iso).ok().map(|dt| dt.timestamp_millis().max(0) as u64)
}

impl From<&Token> for WalRecord {
    fn from(token: &Token) -> Self {
        Self {
            r: token.request_id.clone(),
            a: token.attempt_seq,
            i: token.index,
            m: token.model_id.clone(),
            t: token.text.replace('\n', " ").replace('\r', " "),
            ts: millis_to_iso(token.timestamp_ms),
        }
    }
}

impl WalRecord {
    fn into_token(self) -> Result<Token, String> {
        let timestamp_ms = iso_to_millis(&self.ts).ok_or_else(|| format!("invalid timestamp {:?}", self.ts))?;
        Ok(Token { request_id: self.r, attempt_seq: self.a, index: self.i, model_id: self.m, text: self.t, timestamp_ms })
    }
}

/// Append-only WAL writer/reader with size-based rotation.
///
/// `lock` serializes every append against a concurrent replay cycle: without it, a
/// `write_batch` landing between replay's read and its truncate would be silently
/// erased. [`super::replay::ReplayLoop`] acquires the same lock with
/// [`Self::lock_for_replay`] and holds it across read, copy, and truncate.
pub struct WalHandler {
    path: PathBuf,
    max_bytes: u64,
    lock: tokio::sync::Mutex<()>,
}

impl WalHandler {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self { path: path.into(), max_bytes, lock: tokio::sync::Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the write lock for the duration of a replay cycle (read -> copy ->
    /// truncate), so an in-flight [`Self::write_batch`] cannot interleave with it.
    pub async fn lock_for_replay(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Append a batch as JSON lines, rotating the file first if it has crossed
    /// `max_bytes`.
    pub async fn write_batch(&self, tokens: &[Token]) -> Result<(), PersistenceError> {
        if tokens.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;

        self.rotate_if_needed().await?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PersistenceError::WalWrite { message: e.to_string() })?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistenceError::WalWrite { message: e.to_string() })?;

        let mut buf = String::new();
        for token in tokens {
            let record = WalRecord::from(token);
            let line = serde_json::to_string(&record).map_err(|e| PersistenceError::WalWrite { message: e.to_string() })?;
            buf.push_str(&line);
            buf.push('\n');
        }

        file.write_all(buf.as_bytes()).await.map_err(|e| PersistenceError::WalWrite { message: e.to_string() })?;
        file.flush().await.map_err(|e| PersistenceError::WalWrite { message: e.to_string() })?;
        Ok(())
    }

    async fn rotate_if_needed(&self) -> Result<(), PersistenceError> {
        let size = self.size_bytes().await;
        if size < self.max_bytes {
            return Ok(());
        }

        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let backup_name = format!("wal-{timestamp}.bak");
        let backup_path = self.path.with_file_name(backup_name);
        tokio::fs::rename(&self.path, &backup_path)
            .await
            .map_err(|e| PersistenceError::WalWrite { message: format!("rotate: {e}") })?;
        tracing::info!(backup = %backup_path.display(), "wal file rotated");
        Ok(())
    }

    pub async fn size_bytes(&self) -> u64 {
        tokio::fs::metadata(&self.path).await.map(|m| m.len()).unwrap_or(0)
    }

    /// Read every non-empty line. A line that fails to parse is surfaced as
    /// [`PersistenceError::WalCorruption`] with its 1-indexed line number; the caller
    /// decides whether to abort the replay (the crate's strict-refusal policy: never
    /// silently skip a torn or malformed line).
    pub async fn read_tokens(&self) -> Result<Vec<Token>, PersistenceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::WalWrite { message: e.to_string() }),
        };

        let mut tokens = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let line_number = idx + 1;
            let record: WalRecord = serde_json::from_str(line).map_err(|_| PersistenceError::WalCorruption {
                path: self.path.display().to_string(),
                line_number,
            })?;
            let token = record.into_token().map_err(|_| PersistenceError::WalCorruption {
                path: self.path.display().to_string(),
                line_number,
            })?;
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Delete the WAL file after a fully successful replay.
    pub async fn truncate(&self) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::WalWrite { message: e.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn token(i: u64) -> Token {
        Token { request_id: "req-1".into(), attempt_seq: 1, index: i, model_id: "gpt-4".into(), text: format!("chunk-{i}"), timestamp_ms: 1_700_000_000_000 + i }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir();
        let handler = WalHandler::new(dir.join("tokens.wal"), 100 * 1024 * 1024);
        handler.write_batch(&[token(0), token(1)]).await.unwrap();

        let tokens = handler.read_tokens().await.unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "chunk-0");
        assert_eq!(tokens[1].index, 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let dir = tempdir();
        let handler = WalHandler::new(dir.join("tokens.wal"), 100 * 1024 * 1024);
        handler.write_batch(&[]).await.unwrap();
        assert_eq!(handler.size_bytes().await, 0);
    }

    #[tokio::test]
    async fn read_tokens_on_missing_file_returns_empty() {
        let dir = tempdir();
        let handler = WalHandler::new(dir.join("tokens.wal"), 100 * 1024 * 1024);
        assert!(handler.read_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_line_is_reported_with_its_line_number() {
        let dir = tempdir();
        let path = dir.join("tokens.wal");
        handler_write_raw(&path, "not json\n").await;
        let handler = WalHandler::new(path, 100 * 1024 * 1024);

        let err = handler.read_tokens().await.unwrap_err();
        match err {
            PersistenceError::WalCorruption { line_number, .. } => assert_eq!(line_number, 1),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncate_removes_the_file() {
        let dir = tempdir();
        let handler = WalHandler::new(dir.join("tokens.wal"), 100 * 1024 * 1024);
        handler.write_batch(&[token(0)]).await.unwrap();
        assert!(handler.size_bytes().await > 0);
        handler.truncate().await.unwrap();
        assert_eq!(handler.size_bytes().await, 0);
    }

    #[tokio::test]
    async fn rotates_when_max_bytes_exceeded() {
        let dir = tempdir();
        let path = dir.join("tokens.wal");
        let handler = WalHandler::new(path.clone(), 1);
        handler.write_batch(&[token(0)]).await.unwrap();
        // Second write exceeds the 1-byte threshold, triggering rotation before write.
        handler.write_batch(&[token(1)]).await.unwrap();

        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut backups = 0;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().starts_with("wal-") {
                backups += 1;
            }
        }
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn write_batch_blocks_while_replay_lock_is_held() {
        let dir = tempdir();
        let handler = Arc::new(WalHandler::new(dir.join("tokens.wal"), 100 * 1024 * 1024));

        let guard = handler.lock_for_replay().await;

        let handler_clone = handler.clone();
        let write_task = tokio::spawn(async move { handler_clone.write_batch(&[token(0)]).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(handler.size_bytes().await, 0, "append must not happen while the replay lock is held");

        drop(guard);
        write_task.await.unwrap().unwrap();
        assert!(handler.size_bytes().await > 0);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("llm-relay-wal-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn handler_write_raw(path: &Path, contents: &str) {
        tokio::fs::write(path, contents).await.unwrap();
    }
}
