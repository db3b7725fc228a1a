//! Checkpoint store SPI and the in-memory reference implementation.
//!
//! The store is the only resource mutated by more than one process. All
//! mutations are optimistic-concurrency writes: a claim presents the version
//! token observed at list time, and the store accepts it only if the stored
//! record is unchanged. There are no locks and no leader; this is what lets
//! independent engine instances coordinate without a shared clock.
//!
//! # Implementing a Store
//!
//! All four operations must be idempotent at the protocol level: retrying a
//! call after a transport failure with the same logical record is always
//! safe. `claim_ownership` must never error for an individual lost race —
//! losing claims are silently omitted from the result.
//!
//! ```rust,ignore
//! use flotilla::processor::{CheckpointStore, PartitionOwnership, Checkpoint};
//! use async_trait::async_trait;
//!
//! struct BlobStore { /* ... */ }
//!
//! #[async_trait]
//! impl CheckpointStore for BlobStore {
//!     // list/claim/list/update against blob leases + etags
//! #   async fn list_ownership(&self, _: &str, _: &str, _: &str)
//! #       -> flotilla::error::StoreResult<Vec<PartitionOwnership>> { todo!() }
//! #   async fn claim_ownership(&self, _: &[PartitionOwnership])
//! #       -> flotilla::error::StoreResult<Vec<PartitionOwnership>> { todo!() }
//! #   async fn list_checkpoints(&self, _: &str, _: &str, _: &str)
//! #       -> flotilla::error::StoreResult<Vec<Checkpoint>> { todo!() }
//! #   async fn update_checkpoint(&self, _: &Checkpoint)
//! #       -> flotilla::error::StoreResult<()> { todo!() }
//! }
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::ownership::{Checkpoint, PartitionOwnership};
use crate::error::StoreResult;

/// Durable key-value store holding ownership leases and checkpoints.
///
/// Implementations are pluggable (blob storage, a database, in-memory) and
/// are supplied to the engine at construction.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// List all ownership records for one stream and consumer group.
    ///
    /// Returns stale records too; the caller applies the expiration test.
    async fn list_ownership(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> StoreResult<Vec<PartitionOwnership>>;

    /// Attempt to claim the given ownership records.
    ///
    /// Each record carries the version token observed at list time (`None`
    /// for a first claim). Returns only the claims that won their
    /// compare-and-swap; a claim omitted from the result lost a concurrent
    /// race and must not be treated as an error. Callers must not assume a
    /// 1:1 mapping between input and output.
    async fn claim_ownership(
        &self,
        desired: &[PartitionOwnership],
    ) -> StoreResult<Vec<PartitionOwnership>>;

    /// List all checkpoints for one stream and consumer group.
    async fn list_checkpoints(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> StoreResult<Vec<Checkpoint>>;

    /// Create or overwrite the checkpoint for one partition.
    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()>;
}

type OwnershipKey = (String, String, String, String);

/// In-process [`CheckpointStore`] with real compare-and-swap semantics.
///
/// Every stored ownership record carries a monotonically increasing version
/// drawn from a store-wide counter. A claim wins only if the version it
/// presents matches the stored one (or the record does not exist and the
/// claim presents `None`). Cloning the store shares its state, so a fleet of
/// engines in one process can coordinate through one instance — the same
/// shared-state pattern the integration tests use to simulate a cluster.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    ownership: Arc<RwLock<HashMap<OwnershipKey, PartitionOwnership>>>,
    checkpoints: Arc<RwLock<HashMap<OwnershipKey, Checkpoint>>>,
    next_version: Arc<AtomicU64>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, stream: &str, group: &str, partition: &str) -> OwnershipKey {
        (
            namespace.to_string(),
            stream.to_string(),
            group.to_string(),
            partition.to_string(),
        )
    }

    fn mint_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list_ownership(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> StoreResult<Vec<PartitionOwnership>> {
        let ownership = self.ownership.read().await;
        let records: Vec<PartitionOwnership> = ownership
            .iter()
            .filter(|((ns, st, cg, _), _)| {
                ns == namespace && st == stream && cg == consumer_group
            })
            .map(|(_, record)| record.clone())
            .collect();
        trace!(count = records.len(), "Listed ownership records");
        Ok(records)
    }

    async fn claim_ownership(
        &self,
        desired: &[PartitionOwnership],
    ) -> StoreResult<Vec<PartitionOwnership>> {
        let mut ownership = self.ownership.write().await;
        let mut claimed = Vec::with_capacity(desired.len());

        for claim in desired {
            let key = Self::key(
                &claim.namespace,
                &claim.stream,
                &claim.consumer_group,
                &claim.partition_id,
            );

            let stored_version = ownership.get(&key).and_then(|r| r.version.clone());
            if stored_version != claim.version {
                debug!(
                    partition = %claim.partition_id,
                    owner = %claim.owner_id,
                    "Claim lost optimistic-concurrency race"
                );
                continue;
            }

            let mut accepted = claim.clone();
            accepted.version = Some(self.mint_version());
            ownership.insert(key, accepted.clone());
            claimed.push(accepted);
        }

        Ok(claimed)
    }

    async fn list_checkpoints(
        &self,
        namespace: &str,
        stream: &str,
        consumer_group: &str,
    ) -> StoreResult<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .iter()
            .filter(|((ns, st, cg, _), _)| {
                ns == namespace && st == stream && cg == consumer_group
            })
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect())
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let key = Self::key(
            &checkpoint.namespace,
            &checkpoint.stream,
            &checkpoint.consumer_group,
            &checkpoint.partition_id,
        );
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(key, checkpoint.clone());
        trace!(
            partition = %checkpoint.partition_id,
            sequence = %checkpoint.sequence_number,
            "Checkpoint updated"
        );
        Ok(())
    }
}
