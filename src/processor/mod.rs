//! The event processor: cooperative partition ownership, checkpointing, and
//! per-partition consumption.
//!
//! Submodules split along the coordination seams:
//!
//! - [`store`]: the pluggable checkpoint store SPI and its compare-and-swap
//!   contract, plus the in-memory implementation.
//! - [`ownership`]: the two durable record types shared between instances.
//! - [`load_balancer`]: fair-share claim selection per tick.
//! - [`source`]: the partition consumption SPI.
//! - [`handler`]: processing callbacks and the per-partition context.
//! - [`pump`]: one partition's ordered delivery loop.
//! - [`engine`]: the public processor tying it all together.

pub mod engine;
pub mod handler;
pub mod load_balancer;
pub mod ownership;
pub mod source;
pub mod store;

mod pump;
mod tasks;

pub use engine::{EventProcessor, EventProcessorBuilder};
pub use handler::{
    BatchHandler, ErrorContext, ErrorHandler, EventHandler, HandlerMode, PartitionContext,
    PARTITION_ID_NONE,
};
pub use load_balancer::{ClaimStrategy, LoadBalancerConfig};
pub use ownership::{Checkpoint, PartitionOwnership};
pub use source::{
    EventReader, InMemoryPartitionSource, PartitionSource, ReceivedEvent, StartPosition,
};
pub use store::{CheckpointStore, InMemoryCheckpointStore};
pub use tasks::TaskStatus;
