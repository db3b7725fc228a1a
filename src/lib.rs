//! # flotilla
//!
//! Cooperative partition consumption for partitioned, append-only event
//! streams: an arbitrary fleet of independent processes divides a stream's
//! partitions among themselves, exactly one active owner per partition, with
//! crash-resumable checkpointing — and no leader, no consensus, no shared
//! clock. The only shared resource is a pluggable checkpoint store, and every
//! write to it is an optimistic-concurrency compare-and-swap.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flotilla::prelude::*;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for Printer {
//!     async fn process_event(
//!         &self,
//!         ctx: &PartitionContext,
//!         event: ReceivedEvent,
//!     ) -> flotilla::error::Result<()> {
//!         println!("partition {}: {:?}", ctx.partition_id(), event.body);
//!         ctx.update_checkpoint(&event).await
//!     }
//! }
//!
//! # async fn run() -> flotilla::error::Result<()> {
//! let store = Arc::new(InMemoryCheckpointStore::new());
//! let source = Arc::new(InMemoryPartitionSource::with_partitions(4));
//!
//! let processor = EventProcessor::builder("ns.example.com", "telemetry", "$default")
//!     .with_store(store)
//!     .with_source(source)
//!     .with_event_handler(Arc::new(Printer))
//!     .build()?;
//!
//! processor.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`processor`]: the engine, load balancer, partition pumps, and the
//!   checkpoint-store and consumption-source SPIs.
//! - [`batch`]: size-bounded outgoing event batches.
//! - [`sas`]: the shared-access-signature token credential.
//! - [`error`], [`types`], [`telemetry`]: the ambient layer.
//!
//! Scaling out is just starting another process with the same store, stream,
//! and consumer group; the instances rebalance among themselves within a few
//! ticks. Scaling in is stopping one; its leases expire and the survivors
//! absorb its partitions.

#![forbid(unsafe_code)]

pub mod batch;
pub mod error;
pub mod processor;
pub mod sas;
pub mod telemetry;
pub mod types;

/// Convenience re-exports for the common construction path.
pub mod prelude {
    pub use crate::batch::{BatchOptions, EventBatch, EventData};
    pub use crate::error::{Error, Result, StoreError, StoreResult};
    pub use crate::processor::{
        BatchHandler, CheckpointStore, ClaimStrategy, ErrorContext, ErrorHandler, EventHandler,
        EventProcessor, EventProcessorBuilder, EventReader, InMemoryCheckpointStore,
        InMemoryPartitionSource, LoadBalancerConfig, PartitionContext, PartitionSource,
        ReceivedEvent, StartPosition, PARTITION_ID_NONE,
    };
    pub use crate::sas::{SasToken, SharedKeyCredential};
    pub use crate::types::{PartitionId, SequenceNumber, StreamOffset};
}
