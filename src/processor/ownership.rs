//! Durable coordination records: partition ownership leases and checkpoints.
//!
//! Both record kinds live in the checkpoint store and are the only state
//! shared between cooperating engine instances. The engine holds cached,
//! possibly-stale, in-memory views; the store is the source of truth.
//!
//! An ownership record is never deleted: it simply stops being refreshed and
//! becomes stale once `now - last_modified` exceeds the expiration interval,
//! at which point other owners treat the partition as unowned.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{PartitionId, SequenceNumber, StreamOffset};

/// A time-bounded claim by one engine instance over one partition.
///
/// At most one *active* ownership record exists per
/// `(namespace, stream, consumer_group, partition_id)`; active means the
/// record was refreshed within the ownership expiration interval. The
/// `version` token is the store's opaque optimistic-concurrency handle: every
/// successful claim write must present the version observed at list time, and
/// the store rejects (by omission) claims whose version is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    /// Fully qualified namespace hosting the stream.
    pub namespace: String,
    /// Name of the partitioned stream.
    pub stream: String,
    /// Consumer group this lease belongs to.
    pub consumer_group: String,
    /// The claimed partition.
    pub partition_id: PartitionId,
    /// Unique identifier of the owning engine instance.
    pub owner_id: String,
    /// When the lease was last claimed or refreshed.
    pub last_modified: DateTime<Utc>,
    /// Opaque store version token; `None` for a first-time claim.
    pub version: Option<String>,
}

impl PartitionOwnership {
    /// Whether this lease is still active relative to `now`.
    ///
    /// Expired records are ignored by other owners but not deleted.
    pub fn is_active(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        let expiration = ChronoDuration::from_std(expiration)
            .unwrap_or_else(|_| ChronoDuration::try_seconds(i64::MAX / 1_000).unwrap_or_default());
        now.signed_duration_since(self.last_modified) < expiration
    }

    /// A copy of this record re-stamped for a claim attempt by `owner_id`.
    ///
    /// Keeps the observed `version` so the store can arbitrate the claim via
    /// compare-and-swap.
    pub fn claim_request(&self, owner_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            last_modified: now,
            ..self.clone()
        }
    }
}

/// Durable progress marker for one partition within a consumer group.
///
/// Written only by the partition's current owner; read by any future owner to
/// decide where to resume. Within a continuous ownership span the sequence
/// number is monotonically non-decreasing across checkpoints; after a crash a
/// new owner may resume from a checkpoint older than the last delivered
/// event, which is the at-least-once boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Fully qualified namespace hosting the stream.
    pub namespace: String,
    /// Name of the partitioned stream.
    pub stream: String,
    /// Consumer group the progress belongs to.
    pub consumer_group: String,
    /// The partition this checkpoint covers.
    pub partition_id: PartitionId,
    /// Byte offset of the last processed event.
    pub offset: StreamOffset,
    /// Sequence number of the last processed event.
    pub sequence_number: SequenceNumber,
}
