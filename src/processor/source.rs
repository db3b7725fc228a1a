//! Partition consumption source SPI.
//!
//! A source turns `(partition id, starting position)` into an ordered,
//! resumable sequence of events. The push-based transports this crate stays
//! agnostic of are bridged into a pull interface: each pump owns one
//! [`EventReader`] and awaits events one at a time, which keeps delivery
//! strictly ordered within the partition and makes cancellation a plain
//! `select!` against the pump's shutdown signal.
//!
//! [`InMemoryPartitionSource`] is the in-process implementation used by tests
//! and demos; production sources wrap a real streaming transport.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{PartitionId, SequenceNumber, StreamOffset};

/// Where consumption of a partition begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// The oldest retained event.
    Earliest,
    /// Only events enqueued after the reader opens.
    Latest,
    /// The first event *after* the given byte offset.
    Offset(StreamOffset),
    /// The first event *after* the given sequence number.
    Sequence(SequenceNumber),
    /// The first event enqueued at or after the given instant.
    EnqueuedTime(DateTime<Utc>),
}

/// One event delivered from a partition.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    /// Partition the event was read from.
    pub partition_id: PartitionId,
    /// Event payload.
    pub body: Bytes,
    /// Byte offset within the partition log.
    pub offset: StreamOffset,
    /// Logical position within the partition.
    pub sequence_number: SequenceNumber,
    /// When the service accepted the event.
    pub enqueued_time: DateTime<Utc>,
    /// Application-defined string properties.
    pub properties: HashMap<String, String>,
}

/// Pull interface over one partition's ordered event sequence.
#[async_trait]
pub trait EventReader: Send {
    /// Await the next event. `Ok(None)` means the partition stream has been
    /// closed by the source and no further events will arrive.
    async fn recv(&mut self) -> Result<Option<ReceivedEvent>>;
}

/// Factory for partition readers, plus stream metadata.
#[async_trait]
pub trait PartitionSource: Send + Sync {
    /// All partition ids of the stream. Queried once at engine startup and
    /// cached for the engine's lifetime.
    async fn partition_ids(&self) -> Result<Vec<PartitionId>>;

    /// Open an ordered, cancellable reader over one partition.
    async fn open(
        &self,
        partition_id: &PartitionId,
        position: StartPosition,
    ) -> Result<Box<dyn EventReader>>;
}

struct PartitionLog {
    events: Vec<ReceivedEvent>,
    next_offset: i64,
    closed: bool,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            next_offset: 0,
            closed: false,
        }
    }
}

/// In-process [`PartitionSource`] backed by per-partition append-only logs.
///
/// Cloning shares state, so one source instance can feed several engines in
/// the same process. Events pushed while readers are open are delivered live;
/// offsets and sequence numbers are assigned at push time.
#[derive(Clone)]
pub struct InMemoryPartitionSource {
    logs: Arc<RwLock<HashMap<PartitionId, PartitionLog>>>,
    appended: Arc<Notify>,
}

impl InMemoryPartitionSource {
    /// Create a source with partitions named `"0" .. "{count - 1}"`.
    pub fn with_partitions(count: usize) -> Self {
        let logs = (0..count)
            .map(|p| (p.to_string(), PartitionLog::new()))
            .collect();
        Self {
            logs: Arc::new(RwLock::new(logs)),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Append an event body to a partition, assigning its positions.
    ///
    /// Returns the assigned sequence number.
    pub async fn push(&self, partition_id: &str, body: Bytes) -> Result<SequenceNumber> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(partition_id)
            .ok_or_else(|| Error::Source(format!("unknown partition {partition_id}")))?;

        let sequence_number = SequenceNumber::new(log.events.len() as i64);
        let event = ReceivedEvent {
            partition_id: partition_id.to_string(),
            offset: StreamOffset::new(log.next_offset),
            sequence_number,
            enqueued_time: Utc::now(),
            properties: HashMap::new(),
            body,
        };
        log.next_offset += event.body.len() as i64 + 1;
        log.events.push(event);
        drop(logs);

        self.appended.notify_waiters();
        Ok(sequence_number)
    }

    /// Close every partition; open readers drain and then observe end of
    /// stream.
    pub async fn close(&self) {
        let mut logs = self.logs.write().await;
        for log in logs.values_mut() {
            log.closed = true;
        }
        drop(logs);
        self.appended.notify_waiters();
    }

    async fn start_index(&self, partition_id: &str, position: StartPosition) -> Result<usize> {
        let logs = self.logs.read().await;
        let log = logs
            .get(partition_id)
            .ok_or_else(|| Error::Source(format!("unknown partition {partition_id}")))?;

        let index = match position {
            StartPosition::Earliest => 0,
            StartPosition::Latest => log.events.len(),
            StartPosition::Offset(offset) => log
                .events
                .iter()
                .position(|e| e.offset > offset)
                .unwrap_or(log.events.len()),
            StartPosition::Sequence(seq) => log
                .events
                .iter()
                .position(|e| e.sequence_number > seq)
                .unwrap_or(log.events.len()),
            StartPosition::EnqueuedTime(when) => log
                .events
                .iter()
                .position(|e| e.enqueued_time >= when)
                .unwrap_or(log.events.len()),
        };
        Ok(index)
    }
}

#[async_trait]
impl PartitionSource for InMemoryPartitionSource {
    async fn partition_ids(&self) -> Result<Vec<PartitionId>> {
        let logs = self.logs.read().await;
        let mut ids: Vec<PartitionId> = logs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn open(
        &self,
        partition_id: &PartitionId,
        position: StartPosition,
    ) -> Result<Box<dyn EventReader>> {
        let cursor = self.start_index(partition_id, position).await?;
        debug!(partition = %partition_id, ?position, cursor, "Opened in-memory reader");
        Ok(Box::new(InMemoryEventReader {
            logs: self.logs.clone(),
            appended: self.appended.clone(),
            partition_id: partition_id.clone(),
            cursor,
        }))
    }
}

struct InMemoryEventReader {
    logs: Arc<RwLock<HashMap<PartitionId, PartitionLog>>>,
    appended: Arc<Notify>,
    partition_id: PartitionId,
    cursor: usize,
}

#[async_trait]
impl EventReader for InMemoryEventReader {
    async fn recv(&mut self) -> Result<Option<ReceivedEvent>> {
        loop {
            // Register for wakeup before checking, so a push between the
            // check and the await is not lost.
            let notified = self.appended.notified();

            {
                let logs = self.logs.read().await;
                let log = logs.get(&self.partition_id).ok_or_else(|| {
                    Error::Source(format!("partition {} disappeared", self.partition_id))
                })?;

                if let Some(event) = log.events.get(self.cursor) {
                    self.cursor += 1;
                    return Ok(Some(event.clone()));
                }
                if log.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partition_ids_are_sorted() {
        let source = InMemoryPartitionSource::with_partitions(3);
        let ids = source.partition_ids().await.unwrap();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_reader_delivers_in_order() {
        let source = InMemoryPartitionSource::with_partitions(1);
        for i in 0..5 {
            source
                .push("0", Bytes::from(format!("event-{i}")))
                .await
                .unwrap();
        }
        source.close().await;

        let mut reader = source
            .open(&"0".to_string(), StartPosition::Earliest)
            .await
            .unwrap();
        let mut sequences = Vec::new();
        while let Some(event) = reader.recv().await.unwrap() {
            sequences.push(event.sequence_number.value());
        }
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_sequence_position_is_exclusive() {
        let source = InMemoryPartitionSource::with_partitions(1);
        for i in 0..4 {
            source
                .push("0", Bytes::from(format!("event-{i}")))
                .await
                .unwrap();
        }

        let mut reader = source
            .open(
                &"0".to_string(),
                StartPosition::Sequence(SequenceNumber::new(1)),
            )
            .await
            .unwrap();
        let first = reader.recv().await.unwrap().unwrap();
        assert_eq!(first.sequence_number.value(), 2);
    }

    #[tokio::test]
    async fn test_latest_skips_existing_events() {
        let source = InMemoryPartitionSource::with_partitions(1);
        source.push("0", Bytes::from_static(b"old")).await.unwrap();

        let mut reader = source
            .open(&"0".to_string(), StartPosition::Latest)
            .await
            .unwrap();
        source.push("0", Bytes::from_static(b"new")).await.unwrap();

        let event = reader.recv().await.unwrap().unwrap();
        assert_eq!(event.body, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_live_push_wakes_reader() {
        let source = InMemoryPartitionSource::with_partitions(1);
        let mut reader = source
            .open(&"0".to_string(), StartPosition::Earliest)
            .await
            .unwrap();

        let pusher = source.clone();
        let push = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            pusher.push("0", Bytes::from_static(b"live")).await.unwrap();
        });

        let event = reader.recv().await.unwrap().unwrap();
        assert_eq!(event.body, Bytes::from_static(b"live"));
        push.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_partition_errors() {
        let source = InMemoryPartitionSource::with_partitions(1);
        let result = source.open(&"9".to_string(), StartPosition::Earliest).await;
        assert!(matches!(result, Err(Error::Source(_))));
    }
}
