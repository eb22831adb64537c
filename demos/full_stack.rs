//! Full stack example: provider adaptor + breaker + semaphore + buffer + WAL-backed
//! persistence, wired together the way a caller actually assembles a [`Pipeline`].
//!
//! Runs entirely against in-memory fakes (no network, no real database) so it's
//! runnable anywhere: `cargo run --example full_stack`.

use futures::StreamExt;
use llm_relay::persistence::{DatabaseOps, FakeDatabase, PersistenceService, WalHandler};
use llm_relay::provider::fake::{FakeProviderBackend, Scripted};
use llm_relay::provider::ProviderRegistry;
use llm_relay::{Pipeline, RequestContext};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let backend = FakeProviderBackend::new();
    backend.push("gpt-4", Scripted::Chunks(vec!["The", " quick", " brown", " fox"]));

    let db = Arc::new(FakeDatabase::new());
    let wal_path = std::env::temp_dir().join("llm-relay-demo-tokens.wal");
    let wal = Arc::new(WalHandler::new(wal_path, 100 * 1024 * 1024));
    let persistence = Arc::new(PersistenceService::new(wal, db.clone() as Arc<dyn DatabaseOps>));

    let registry = Arc::new(ProviderRegistry::default());
    let pipeline = Arc::new(Pipeline::new(registry, Arc::new(backend), persistence, 16, Duration::from_secs(1)));

    let ctx = RequestContext::new("demo-request-1");
    let mut stream = pipeline.generate_tokens("gpt-4".into(), "tell me a story".into(), ctx);

    print!("gpt-4: ");
    while let Some(item) = stream.next().await {
        match item {
            Ok(token) => print!("{}", token.text),
            Err(e) => {
                eprintln!("\ngeneration failed: {e}");
                return;
            }
        }
    }
    println!();

    let committed = db.committed_tokens().await;
    println!("committed {} tokens to the database in order", committed.len());
}
