//! Token Builder (C5): assigns monotonic, per-attempt indices. Bound to exactly one
//! `(request_id, attempt_seq, model_id)`; a new attempt always gets a fresh builder.

use crate::model::Token;

pub struct TokenBuilder {
    request_id: String,
    attempt_seq: u32,
    model_id: String,
    next_index: u64,
}

impl TokenBuilder {
    pub fn new(request_id: impl Into<String>, attempt_seq: u32, model_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), attempt_seq, model_id: model_id.into(), next_index: 0 }
    }

    /// Build the next token from a raw chunk, consuming the current index.
    pub fn build(&mut self, raw_text: impl Into<String>) -> Token {
        let token = Token {
            request_id: self.request_id.clone(),
            attempt_seq: self.attempt_seq,
            index: self.next_index,
            model_id: self.model_id.clone(),
            text: raw_text.into(),
            timestamp_ms: Token::now_ms(),
        };
        self.next_index += 1;
        token
    }
}
