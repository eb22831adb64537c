//! Core data model: the types every component passes around.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One streamed output element. Uniquely keyed by `(request_id, attempt_seq, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub request_id: String,
    pub attempt_seq: u32,
    pub index: u64,
    pub model_id: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Token {
    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub request_id: String,
    pub attempt_seq: u32,
    pub provider: String,
    pub model_id: String,
    pub status: AttemptStatus,
    pub started_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub prompt: String,
    pub ordered_models: Vec<String>,
    pub user_id: Option<String>,
    pub status: RequestStatus,
    pub created_at_ms: u64,
}

/// The request-scoped knobs the pipeline consults for retry/fallback behavior.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub max_retries: u32,
    /// Models to fall back to, in order, not including the initial model.
    pub fallback_models: Vec<String>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: None,
            max_retries: 3,
            fallback_models: Vec::new(),
        }
    }
}
