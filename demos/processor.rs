//! Two processor instances sharing one store and source.
//!
//! Run with `cargo run --example processor`. The instances divide the eight
//! partitions between themselves, process a burst of events, then one stops
//! and the survivor absorbs its partitions.

use bytes::Bytes;
use flotilla::prelude::*;
use flotilla::telemetry::{init_logging, LogFormat};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

struct Printer {
    name: &'static str,
}

#[async_trait::async_trait]
impl EventHandler for Printer {
    async fn process_event(&self, ctx: &PartitionContext, event: ReceivedEvent) -> Result<()> {
        info!(
            instance = self.name,
            partition = %ctx.partition_id(),
            sequence = %event.sequence_number,
            body = ?event.body,
            "Processed event"
        );
        ctx.update_checkpoint(&event).await
    }
}

fn build(
    name: &'static str,
    store: Arc<InMemoryCheckpointStore>,
    source: Arc<InMemoryPartitionSource>,
) -> Result<EventProcessor> {
    EventProcessor::builder("demo.example.com", "telemetry", "$default")
        .with_owner_id(name)
        .with_store(store)
        .with_source(source)
        .with_event_handler(Arc::new(Printer { name }))
        .with_load_balancer_config(
            LoadBalancerConfig::default()
                .with_update_interval(Duration::from_millis(200))
                .with_ownership_expiration(Duration::from_secs(2))
                .with_claim_strategy(ClaimStrategy::Balanced),
        )
        .build()
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(LogFormat::from_env())?;

    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemoryPartitionSource::with_partitions(8));

    let alpha = build("alpha", store.clone(), source.clone())?;
    let beta = build("beta", store.clone(), source.clone())?;
    alpha.start().await?;
    beta.start().await?;

    // Let the fleet converge, then feed it.
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!(alpha = ?alpha.owned_partitions(), beta = ?beta.owned_partitions(), "Converged");

    for i in 0..32 {
        let partition = (i % 8).to_string();
        source
            .push(&partition, Bytes::from(format!("reading-{i}")))
            .await?;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    // beta leaves; its leases expire and alpha takes over every partition.
    info!("Stopping beta");
    beta.stop().await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    info!(alpha = ?alpha.owned_partitions(), "After scale-in");

    for i in 32..40 {
        let partition = (i % 8).to_string();
        source
            .push(&partition, Bytes::from(format!("reading-{i}")))
            .await?;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    alpha.stop().await;
    Ok(())
}
