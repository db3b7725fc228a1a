//! Processor SPI: event/batch handlers, error handler, and the per-partition
//! context they run against.
//!
//! A processor runs in exactly one of two modes, chosen at engine
//! construction (configuring both is a build-time error):
//!
//! - **Single**: [`EventHandler::process_event`] is invoked once per event,
//!   strictly in order within the partition.
//! - **Batch**: [`BatchHandler::process_batch`] is invoked with up to
//!   `max_batch_size` events, or fewer once `max_wait` elapses with at least
//!   one event buffered.
//!
//! Handlers may request a checkpoint through the [`PartitionContext`]; the
//! write completes before the pump advances to the next event (single mode)
//! or the next batch (batch mode).

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tracing::trace;

use super::ownership::Checkpoint;
use super::source::ReceivedEvent;
use super::store::CheckpointStore;
use crate::error::{Error, Result};
use crate::types::{PartitionId, SequenceNumber, StreamOffset};

/// Sentinel partition id used when an error is not scoped to one partition
/// (e.g. a store-wide `list_ownership` failure).
pub const PARTITION_ID_NONE: &str = "NONE";

/// Per-event processing callback (single mode).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. Returning an error surfaces it through the error
    /// handler; a non-transient error stops the partition's pump.
    async fn process_event(&self, ctx: &PartitionContext, event: ReceivedEvent) -> Result<()>;
}

/// Per-batch processing callback (batch mode).
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Process an ordered batch of events from one partition. The batch is
    /// never empty.
    async fn process_batch(&self, ctx: &PartitionContext, events: Vec<ReceivedEvent>)
    -> Result<()>;
}

/// Error callback; invoked for every caught failure with enough context to
/// correlate and retry externally. The engine never stops silently.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn process_error(&self, ctx: ErrorContext);
}

/// The processing mode and its callback, fixed at construction.
#[derive(Clone)]
pub enum HandlerMode {
    /// One callback per event.
    Single(Arc<dyn EventHandler>),
    /// One callback per accumulated batch.
    Batch {
        handler: Arc<dyn BatchHandler>,
        /// Maximum events per callback.
        max_batch_size: usize,
        /// Maximum time to wait for a partial batch before flushing it.
        max_wait: Duration,
    },
}

/// Context handed to the error handler.
#[derive(Debug)]
pub struct ErrorContext {
    pub namespace: String,
    pub stream: String,
    pub consumer_group: String,
    /// The failing partition, or [`PARTITION_ID_NONE`] for store-wide
    /// failures.
    pub partition_id: PartitionId,
    pub error: Error,
}

/// Per-partition runtime state owned by a pump.
///
/// Created when the pump starts, destroyed when it stops. Tracks the last
/// delivered position and offers the checkpoint write path to handlers.
pub struct PartitionContext {
    namespace: String,
    stream: String,
    consumer_group: String,
    partition_id: PartitionId,
    owner_id: String,
    store: Arc<dyn CheckpointStore>,
    last_offset: AtomicI64,
    last_sequence: AtomicI64,
    checkpoint_pending: AtomicBool,
    cancelled: AtomicBool,
}

impl PartitionContext {
    pub(crate) fn new(
        namespace: String,
        stream: String,
        consumer_group: String,
        partition_id: PartitionId,
        owner_id: String,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            namespace,
            stream,
            consumer_group,
            partition_id,
            owner_id,
            store,
            last_offset: AtomicI64::new(StreamOffset::EARLIEST.value()),
            last_sequence: AtomicI64::new(SequenceNumber::UNSET.value()),
            checkpoint_pending: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Identity of the engine instance that owns this partition.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Sequence number of the last event delivered to the handler, or
    /// [`SequenceNumber::UNSET`] before the first delivery.
    pub fn last_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::new(self.last_sequence.load(Ordering::Acquire))
    }

    /// Whether the pump has been asked to stop. Long-running handlers can
    /// poll this to cut work short during shutdown or ownership loss.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Durably record progress at the given event.
    ///
    /// Only the current owner calls this; the write is idempotent and safe to
    /// retry after a transport failure.
    pub async fn update_checkpoint(&self, event: &ReceivedEvent) -> Result<()> {
        self.update_checkpoint_at(event.offset, event.sequence_number)
            .await
    }

    /// Durably record progress at an explicit position.
    pub async fn update_checkpoint_at(
        &self,
        offset: StreamOffset,
        sequence_number: SequenceNumber,
    ) -> Result<()> {
        self.checkpoint_pending.store(true, Ordering::Release);
        let checkpoint = Checkpoint {
            namespace: self.namespace.clone(),
            stream: self.stream.clone(),
            consumer_group: self.consumer_group.clone(),
            partition_id: self.partition_id.clone(),
            offset,
            sequence_number,
        };
        let result = self.store.update_checkpoint(&checkpoint).await;
        self.checkpoint_pending.store(false, Ordering::Release);
        trace!(
            partition = %self.partition_id,
            sequence = %sequence_number,
            ok = result.is_ok(),
            "Checkpoint write"
        );
        result.map_err(Error::Store)
    }

    /// Whether a checkpoint write is currently in flight.
    pub fn checkpoint_pending(&self) -> bool {
        self.checkpoint_pending.load(Ordering::Acquire)
    }

    pub(crate) fn record_delivery(&self, event: &ReceivedEvent) {
        self.last_offset
            .store(event.offset.value(), Ordering::Release);
        self.last_sequence
            .store(event.sequence_number.value(), Ordering::Release);
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
