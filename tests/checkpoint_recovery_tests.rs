//! Checkpoint resumption after simulated owner crashes.
//!
//! A crashed owner leaves behind its last durable checkpoint; these tests
//! seed the store the way such an owner would have and verify that a fresh
//! instance resumes strictly after the checkpointed event.

use bytes::Bytes;
use flotilla::prelude::*;
use flotilla::processor::Checkpoint;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct SequenceRecorder {
    sequences: Mutex<Vec<i64>>,
}

#[async_trait::async_trait]
impl EventHandler for SequenceRecorder {
    async fn process_event(&self, ctx: &PartitionContext, event: ReceivedEvent) -> Result<()> {
        self.sequences
            .lock()
            .unwrap()
            .push(event.sequence_number.value());
        ctx.update_checkpoint(&event).await
    }
}

fn fast_config() -> LoadBalancerConfig {
    LoadBalancerConfig::default()
        .with_update_interval(Duration::from_millis(25))
        .with_ownership_expiration(Duration::from_millis(400))
        .with_claim_strategy(ClaimStrategy::Balanced)
}

async fn seeded_source(events: usize) -> Arc<InMemoryPartitionSource> {
    let source = InMemoryPartitionSource::with_partitions(1);
    for i in 0..events {
        source
            .push("0", Bytes::from(format!("event-{i}")))
            .await
            .unwrap();
    }
    Arc::new(source)
}

fn crash_checkpoint(sequence: i64, offset: i64) -> Checkpoint {
    Checkpoint {
        namespace: "ns".into(),
        stream: "stream".into(),
        consumer_group: "cg".into(),
        partition_id: "0".into(),
        offset: StreamOffset::new(offset),
        sequence_number: SequenceNumber::new(sequence),
    }
}

async fn run_and_collect(
    store: Arc<InMemoryCheckpointStore>,
    source: Arc<InMemoryPartitionSource>,
) -> Vec<i64> {
    let recorder = Arc::new(SequenceRecorder {
        sequences: Mutex::new(Vec::new()),
    });
    let processor = EventProcessor::builder("ns", "stream", "cg")
        .with_owner_id("fresh-owner")
        .with_store(store)
        .with_source(source.clone())
        .with_event_handler(recorder.clone())
        .with_load_balancer_config(fast_config())
        .build()
        .unwrap();

    processor.start().await.unwrap();
    source.close().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    processor.stop().await;

    let sequences = recorder.sequences.lock().unwrap().clone();
    sequences
}

#[tokio::test]
async fn fresh_owner_resumes_after_checkpointed_sequence() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = seeded_source(5).await;

    // The previous owner checkpointed sequence 2 before dying. Its offset is
    // deliberately left unset so resumption goes through the sequence path.
    store
        .update_checkpoint(&crash_checkpoint(2, -1))
        .await
        .unwrap();

    let sequences = run_and_collect(store, source).await;
    assert_eq!(sequences, vec![3, 4]);
    assert!(sequences.iter().all(|&s| s >= 2));
}

#[tokio::test]
async fn fresh_owner_resumes_after_checkpointed_offset() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = seeded_source(5).await;

    // In-memory offsets advance by body length + 1 per event ("event-N" is
    // 7 bytes): sequence 1 sits at offset 8.
    store
        .update_checkpoint(&crash_checkpoint(1, 8))
        .await
        .unwrap();

    let sequences = run_and_collect(store, source).await;
    assert_eq!(sequences, vec![2, 3, 4]);
}

#[tokio::test]
async fn no_checkpoint_starts_from_default_position() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = seeded_source(3).await;

    let sequences = run_and_collect(store, source).await;
    assert_eq!(sequences, vec![0, 1, 2]);
}

#[tokio::test]
async fn handler_checkpoints_survive_into_the_store() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = seeded_source(4).await;

    let sequences = run_and_collect(store.clone(), source).await;
    assert_eq!(sequences, vec![0, 1, 2, 3]);

    let checkpoints = store.list_checkpoints("ns", "stream", "cg").await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].sequence_number, SequenceNumber::new(3));
}
