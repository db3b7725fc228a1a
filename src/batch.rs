//! Size-bounded outgoing event batches.
//!
//! A batch accumulates events up to a byte limit so callers can publish
//! transport-frame-sized groups. [`EventBatch::try_add`] distinguishes two
//! rejection cases:
//!
//! - `Ok(false)`: the event does not fit in *this* batch; flush and retry in
//!   a fresh one.
//! - [`Error::PayloadTooLarge`]: the event exceeds the size limit on its own
//!   and can never fit, no matter how empty the batch is.
//!
//! An event's footprint is its payload plus, for each property, the key and
//! value bytes and a fixed per-property framing allowance. A property-less
//! event costs exactly its payload size.

use bytes::Bytes;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::PartitionId;

/// Framing bytes charged per property entry (length prefixes and type tags).
const PROPERTY_FRAMING_BYTES: usize = 8;

/// An event to be published.
#[derive(Debug, Clone)]
pub struct EventData {
    /// Event payload.
    pub body: Bytes,
    /// Application-defined string properties.
    pub properties: HashMap<String, String>,
}

impl EventData {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Serialized footprint used for batch-capacity accounting.
    pub fn size_bytes(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len() + PROPERTY_FRAMING_BYTES)
            .sum();
        self.body.len() + properties
    }
}

/// Routing and capacity options for a batch.
///
/// `partition_id` pins the batch to one partition; `partition_key` hashes to
/// a service-chosen but stable partition. Setting both is a construction-time
/// error; setting neither lets the service assign a partition per batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_size_bytes: usize,
    pub partition_id: Option<PartitionId>,
    pub partition_key: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: 1024 * 1024,
            partition_id: None,
            partition_key: None,
        }
    }
}

impl BatchOptions {
    pub fn with_max_size_bytes(mut self, max_size_bytes: usize) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    pub fn with_partition_id(mut self, partition_id: impl Into<PartitionId>) -> Self {
        self.partition_id = Some(partition_id.into());
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }
}

/// A size-bounded, append-only group of events bound for one partition (or
/// one partition key).
#[derive(Debug)]
pub struct EventBatch {
    options: BatchOptions,
    events: Vec<EventData>,
    size_bytes: usize,
}

impl EventBatch {
    /// Create an empty batch, validating the routing options.
    pub fn new(options: BatchOptions) -> Result<Self> {
        if options.max_size_bytes == 0 {
            return Err(Error::Config("max_size_bytes must be non-zero".into()));
        }
        if options.partition_id.is_some() && options.partition_key.is_some() {
            return Err(Error::Config(
                "partition_id and partition_key are mutually exclusive".into(),
            ));
        }
        Ok(Self {
            options,
            events: Vec::new(),
            size_bytes: 0,
        })
    }

    /// Attempt to append an event.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` if the event would push the
    /// batch over its limit (the batch is unchanged; flush and retry), or
    /// [`Error::PayloadTooLarge`] if the event exceeds the limit on its own.
    pub fn try_add(&mut self, event: EventData) -> Result<bool> {
        let size = event.size_bytes();
        if size > self.options.max_size_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                max_size: self.options.max_size_bytes,
            });
        }
        if self.size_bytes + size > self.options.max_size_bytes {
            return Ok(false);
        }
        self.size_bytes += size;
        self.events.push(event);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Accounted size of the events currently in the batch.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_size_bytes(&self) -> usize {
        self.options.max_size_bytes
    }

    pub fn partition_id(&self) -> Option<&PartitionId> {
        self.options.partition_id.as_ref()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.options.partition_key.as_deref()
    }

    /// Consume the batch, yielding its events for a transport to frame.
    pub fn into_events(self) -> Vec<EventData> {
        self.events
    }
}
