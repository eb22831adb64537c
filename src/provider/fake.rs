//! A deterministic in-memory [`ProviderBackend`] used by tests and the `demos/` walkthrough.
//! Real provider SDKs are external collaborators (out of scope); this fake lets the rest
//! of the pipeline be exercised without network access.

use super::{ProviderBackend, RawChunk};
use crate::error::ProviderCallError;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;

/// A scripted response: either a sequence of chunks, or a failure raised partway through.
pub enum Scripted {
    Chunks(Vec<&'static str>),
    FailAfter { chunks: Vec<&'static str>, error: ProviderCallError },
}

#[derive(Default)]
pub struct FakeProviderBackend {
    scripts: Mutex<HashMap<String, Vec<Scripted>>>,
}

impl FakeProviderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response for `model`. Calls consume scripts in FIFO order; once
    /// exhausted, a model yields a single generic chunk and ends cleanly.
    pub fn push(&self, model: &str, script: Scripted) {
        self.scripts.lock().expect("fake provider mutex poisoned").entry(model.to_string()).or_default().push(script);
    }
}

#[async_trait::async_trait]
impl ProviderBackend for FakeProviderBackend {
    async fn stream_raw(
        &self,
        _provider: &str,
        model: &str,
        _prompt: &str,
    ) -> BoxStream<'static, Result<RawChunk, ProviderCallError>> {
        let script = {
            let mut scripts = self.scripts.lock().expect("fake provider mutex poisoned");
            scripts.get_mut(model).and_then(|v| if v.is_empty() { None } else { Some(v.remove(0)) })
        };

        let items: Vec<Result<RawChunk, ProviderCallError>> = match script {
            Some(Scripted::Chunks(chunks)) => {
                chunks.into_iter().map(|c| Ok(c.to_string())).collect()
            }
            Some(Scripted::FailAfter { chunks, error }) => {
                let mut items: Vec<_> = chunks.into_iter().map(|c| Ok(c.to_string())).collect();
                items.push(Err(error));
                items
            }
            None => vec![Ok(format!("response from {model}"))],
        };

        stream::iter(items).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_scripted_chunks() {
        let backend = FakeProviderBackend::new();
        backend.push("gpt-4", Scripted::Chunks(vec!["A", "B", "C"]));

        let mut stream = backend.stream_raw("openai", "gpt-4", "hi").await;
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.unwrap());
        }
        assert_eq!(out, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn script_can_fail_partway_through() {
        let backend = FakeProviderBackend::new();
        backend.push(
            "claude-3-opus",
            Scripted::FailAfter { chunks: vec!["A", "B"], error: ProviderCallError::Timeout },
        );

        let mut stream = backend.stream_raw("anthropic", "claude-3-opus", "hi").await;
        let a = stream.next().await.unwrap();
        let b = stream.next().await.unwrap();
        let err = stream.next().await.unwrap();
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
        assert!(matches!(err.unwrap_err(), ProviderCallError::Timeout));
    }

    #[tokio::test]
    async fn exhausted_script_falls_back_to_generic_response() {
        let backend = FakeProviderBackend::new();
        let mut stream = backend.stream_raw("openai", "gpt-4", "hi").await;
        let chunk = stream.next().await.unwrap().unwrap();
        assert!(chunk.contains("gpt-4"));
    }
}
