//! Multi-instance load-balancing scenarios against a shared in-memory store.

use flotilla::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Sink;

#[async_trait::async_trait]
impl EventHandler for Sink {
    async fn process_event(&self, _ctx: &PartitionContext, _event: ReceivedEvent) -> Result<()> {
        Ok(())
    }
}

fn fast_config() -> LoadBalancerConfig {
    LoadBalancerConfig::default()
        .with_update_interval(Duration::from_millis(25))
        .with_ownership_expiration(Duration::from_millis(400))
        .with_claim_strategy(ClaimStrategy::Balanced)
}

fn processor(
    owner: &str,
    store: Arc<InMemoryCheckpointStore>,
    source: Arc<InMemoryPartitionSource>,
) -> EventProcessor {
    EventProcessor::builder("ns", "stream", "cg")
        .with_owner_id(owner)
        .with_store(store)
        .with_source(source)
        .with_event_handler(Arc::new(Sink))
        .with_load_balancer_config(fast_config())
        .build()
        .unwrap()
}

async fn settle(processors: &[&EventProcessor], ticks: u32) {
    tokio::time::sleep(Duration::from_millis(25 * u64::from(ticks))).await;
    for p in processors {
        assert!(p.is_running());
    }
}

#[tokio::test]
async fn two_instances_converge_to_fair_shares() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemoryPartitionSource::with_partitions(6));

    let a = processor("owner-a", store.clone(), source.clone());
    let b = processor("owner-b", store, source);
    a.start().await.unwrap();
    b.start().await.unwrap();
    settle(&[&a, &b], 20).await;

    let a_owned = a.owned_partitions();
    let b_owned = b.owned_partitions();
    assert_eq!(a_owned.len(), 3, "a={a_owned:?} b={b_owned:?}");
    assert_eq!(b_owned.len(), 3, "a={a_owned:?} b={b_owned:?}");

    // Union covers every partition exactly once.
    let union: HashSet<_> = a_owned.iter().chain(b_owned.iter()).collect();
    assert_eq!(union.len(), 6);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn three_instances_hold_floor_or_ceil() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemoryPartitionSource::with_partitions(8));

    let processors: Vec<EventProcessor> = ["owner-a", "owner-b", "owner-c"]
        .iter()
        .map(|o| processor(o, store.clone(), source.clone()))
        .collect();
    for p in &processors {
        p.start().await.unwrap();
    }
    settle(&processors.iter().collect::<Vec<_>>(), 40).await;

    let shares: Vec<Vec<PartitionId>> =
        processors.iter().map(|p| p.owned_partitions()).collect();
    let total: usize = shares.iter().map(Vec::len).sum();
    assert_eq!(total, 8, "shares: {shares:?}");
    for share in &shares {
        // floor(8/3) = 2, ceil(8/3) = 3.
        assert!((2..=3).contains(&share.len()), "shares: {shares:?}");
    }

    let union: HashSet<_> = shares.iter().flatten().collect();
    assert_eq!(union.len(), 8);

    for p in processors {
        p.stop().await;
    }
}

#[tokio::test]
async fn survivor_absorbs_stopped_instances_partitions() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemoryPartitionSource::with_partitions(4));

    let a = processor("owner-a", store.clone(), source.clone());
    let b = processor("owner-b", store, source);
    a.start().await.unwrap();
    b.start().await.unwrap();
    settle(&[&a, &b], 20).await;
    assert_eq!(a.owned_partitions().len() + b.owned_partitions().len(), 4);

    // b leaves; its leases expire and a takes everything.
    b.stop().await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(a.owned_partitions().len(), 4);

    a.stop().await;
}

#[tokio::test]
async fn late_joiner_steals_up_to_fair_share() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemoryPartitionSource::with_partitions(4));

    let a = processor("owner-a", store.clone(), source.clone());
    a.start().await.unwrap();
    settle(&[&a], 15).await;
    assert_eq!(a.owned_partitions().len(), 4);

    let b = processor("owner-b", store, source);
    b.start().await.unwrap();
    settle(&[&a, &b], 40).await;

    let a_owned = a.owned_partitions();
    let b_owned = b.owned_partitions();
    assert_eq!(a_owned.len() + b_owned.len(), 4);
    assert_eq!(a_owned.len(), 2, "a={a_owned:?} b={b_owned:?}");
    assert_eq!(b_owned.len(), 2, "a={a_owned:?} b={b_owned:?}");

    a.stop().await;
    b.stop().await;
}
