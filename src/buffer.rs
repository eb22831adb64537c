//! Buffer Manager (C6): per-request IDLE/BUFFER/FLUSHING state machine with
//! back-pressure. `add` blocks while FLUSHING; `drain` hands the frozen snapshot to
//! the caller (normally [`crate::persistence::PersistenceService`]) and releases
//! waiters once the caller reports the outcome.

use crate::model::Token;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Idle,
    Buffer,
    Flushing,
}

struct Inner {
    state: BufferState,
    tokens: Vec<Token>,
    first_token_at: Option<Instant>,
}

pub struct BufferManager {
    batch_size: usize,
    flush_age: Duration,
    inner: tokio::sync::Mutex<Inner>,
    notify: Notify,
}

impl BufferManager {
    pub fn new(batch_size: usize, flush_age: Duration) -> Self {
        Self {
            batch_size,
            flush_age,
            inner: tokio::sync::Mutex::new(Inner { state: BufferState::Idle, tokens: Vec::new(), first_token_at: None }),
            notify: Notify::new(),
        }
    }

    /// Append a token, blocking while the buffer is FLUSHING.
    pub async fn add(&self, token: Token) {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.state == BufferState::Flushing {
                // Register interest before releasing the lock: `drain` notifies after
                // its own lock is dropped, so waiting to call `notified()` until after
                // ours is dropped could miss that wakeup and hang until the next one.
                let notified = self.notify.notified();
                drop(inner);
                notified.await;
                continue;
            }
            if inner.state == BufferState::Idle {
                inner.state = BufferState::Buffer;
                inner.first_token_at = Some(Instant::now());
            }
            inner.tokens.push(token);
            return;
        }
    }

    /// True if the size or age trigger has fired.
    pub async fn flush_needed(&self) -> bool {
        let inner = self.inner.lock().await;
        if inner.state != BufferState::Buffer {
            return false;
        }
        if inner.tokens.len() >= self.batch_size {
            return true;
        }
        match inner.first_token_at {
            Some(t) => t.elapsed() >= self.flush_age,
            None => false,
        }
    }

    /// Freeze the buffer (BUFFER/IDLE -> FLUSHING) and hand its contents to `persist`.
    /// On success the buffer returns to IDLE and waiters are released. On a fatal
    /// error the buffer reverts to BUFFER with its tokens intact and the error
    /// propagates to the caller.
    pub async fn drain<F, Fut, E>(&self, persist: F) -> Result<(), E>
    where
        F: FnOnce(Vec<Token>) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
    {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            if inner.tokens.is_empty() {
                return Ok(());
            }
            inner.state = BufferState::Flushing;
            std::mem::take(&mut inner.tokens)
        };

        match persist(snapshot.clone()).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                inner.state = BufferState::Idle;
                inner.first_token_at = None;
                drop(inner);
                self.notify.notify_waiters();
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                // Revert: put the drained tokens back ahead of anything appended
                // since drain started (nothing can have been appended: FLUSHING
                // blocks add()).
                inner.tokens = snapshot;
                inner.state = BufferState::Buffer;
                drop(inner);
                self.notify.notify_waiters();
                Err(e)
            }
        }
    }

    /// Drain unconditionally, even if `flush_needed` would say no. Used at stream
    /// end, attempt switch, and shutdown.
    pub async fn force_flush<F, Fut, E>(&self, persist: F) -> Result<(), E>
    where
        F: FnOnce(Vec<Token>) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
    {
        self.drain(persist).await
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.tokens.len()
    }
}
