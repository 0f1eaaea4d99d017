//! Re-embedding job example
//!
//! Pushes a stream of synthetic documents through a flaky "embedding service"
//! using the batch engine. Configuration comes from `BATCH_*` environment
//! variables (or a `.env` file); Ctrl-C cancels the job cooperatively.
//!
//! Run:
//!   BATCH_PROCESSING_MODE=adaptive BATCH_PARALLEL_WORKERS=8 \
//!     cargo run --example reembed -p everruns-batch
//!
//! Resume a crashed run by keeping the same process and checkpoint store;
//! see `tests/processor_test.rs` for the restart flow.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use everruns_batch::prelude::*;

const DOCUMENTS: u64 = 500;

#[derive(Debug, Clone)]
struct Document {
    id: u64,
    text: String,
}

/// Simulated embedding call: a little latency and occasional 503s
async fn embed(document: &Document) -> anyhow::Result<Vec<f32>> {
    let latency = rand::thread_rng().gen_range(2..20);
    tokio::time::sleep(Duration::from_millis(latency)).await;

    if rand::thread_rng().gen_bool(0.05) {
        anyhow::bail!("embedding service returned 503 for document {}", document.id);
    }
    Ok(document.text.bytes().map(f32::from).collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded .env from {path:?}");
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,everruns_batch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BatchConfig::from_env()?;
    tracing::info!(config = %config.to_canonical_json()?, "loaded batch config");

    let processor = Arc::new(BatchProcessor::in_memory());
    let job_id = processor.create_job_with_tags(
        Some(DOCUMENTS),
        config,
        BTreeMap::from([("kind".to_string(), "reembed".to_string())]),
    )?;

    let documents = stream::iter(0..DOCUMENTS).map(|id| Document {
        id,
        text: format!("document body #{id}"),
    });

    let work = work_fn(|ctx: ItemContext, document: Document| async move {
        if document.text.is_empty() {
            return Err(ItemError::fatal(format!("document {} has no text", document.id)));
        }
        let vector = embed(&document).await?;
        tracing::trace!(index = ctx.index, attempt = ctx.attempt, dims = vector.len(), "embedded");
        Ok(())
    });

    let canceller = Arc::clone(&processor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, cancelling job");
            if let Err(e) = canceller.cancel(job_id) {
                tracing::error!(error = %e, "cancel failed");
            }
        }
    });

    let summary = processor
        .run(job_id, ItemSource::from_stream(documents), work)
        .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
