//! The event processor engine: construction, the balancing timer, and pump
//! lifecycle management.
//!
//! One engine instance competes with its peers purely through the checkpoint
//! store. Every `update_interval` it runs a balancing tick: prune pumps that
//! exited on their own, renew and claim leases through the load balancer,
//! start pumps for newly won partitions at their checkpointed position, and
//! stop pumps for partitions lost to other owners.
//!
//! A failed tick never terminates the engine. Store-wide failures are routed
//! to the error handler with the [`PARTITION_ID_NONE`] sentinel and the timer
//! simply fires again. A tick still running when the next fires causes that
//! firing to be skipped, never queued.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::handler::{
    BatchHandler, ErrorContext, ErrorHandler, EventHandler, HandlerMode, PartitionContext,
    PARTITION_ID_NONE,
};
use super::load_balancer::{LoadBalancer, LoadBalancerConfig};
use super::ownership::Checkpoint;
use super::pump::{report_scoped, PartitionPump};
use super::source::{PartitionSource, StartPosition};
use super::store::CheckpointStore;
use super::tasks::{TaskRegistry, TaskStatus};
use crate::error::{Error, Result};
use crate::types::PartitionId;

/// Fallback error handler: everything goes to the log.
struct LoggingErrorHandler;

#[async_trait::async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn process_error(&self, ctx: ErrorContext) {
        warn!(
            partition = %ctx.partition_id,
            consumer_group = %ctx.consumer_group,
            error = %ctx.error,
            "Processor error"
        );
    }
}

fn default_owner_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "processor-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Builder for [`EventProcessor`].
///
/// `store`, `source`, and exactly one of `event_handler` / `batch_handler`
/// are required; everything else has a default.
pub struct EventProcessorBuilder {
    namespace: String,
    stream: String,
    consumer_group: String,
    owner_id: Option<String>,
    store: Option<Arc<dyn CheckpointStore>>,
    source: Option<Arc<dyn PartitionSource>>,
    event_handler: Option<Arc<dyn EventHandler>>,
    batch_handler: Option<(Arc<dyn BatchHandler>, usize, Duration)>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    load_balancer: LoadBalancerConfig,
    default_start_position: StartPosition,
    pump_stop_timeout: Duration,
}

impl EventProcessorBuilder {
    pub fn new(
        namespace: impl Into<String>,
        stream: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            stream: stream.into(),
            consumer_group: consumer_group.into(),
            owner_id: None,
            store: None,
            source: None,
            event_handler: None,
            batch_handler: None,
            error_handler: None,
            load_balancer: LoadBalancerConfig::default(),
            default_start_position: StartPosition::Earliest,
            pump_stop_timeout: Duration::from_secs(10),
        }
    }

    /// Override the generated owner identity. Must be unique per live
    /// instance; duplicate ids make two engines renew each other's leases.
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn PartitionSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Process events one at a time. Mutually exclusive with
    /// [`with_batch_handler`](Self::with_batch_handler).
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Process events in batches of up to `max_batch_size`, flushing partial
    /// batches after `max_wait`. Mutually exclusive with
    /// [`with_event_handler`](Self::with_event_handler).
    pub fn with_batch_handler(
        mut self,
        handler: Arc<dyn BatchHandler>,
        max_batch_size: usize,
        max_wait: Duration,
    ) -> Self {
        self.batch_handler = Some((handler, max_batch_size, max_wait));
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_load_balancer_config(mut self, config: LoadBalancerConfig) -> Self {
        self.load_balancer = config;
        self
    }

    /// Where to start on a partition that has no checkpoint.
    pub fn with_default_start_position(mut self, position: StartPosition) -> Self {
        self.default_start_position = position;
        self
    }

    /// Soft deadline when stopping a pump; a loop that overruns it is
    /// detached rather than aborted.
    pub fn with_pump_stop_timeout(mut self, timeout: Duration) -> Self {
        self.pump_stop_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<EventProcessor> {
        if self.namespace.is_empty() || self.stream.is_empty() || self.consumer_group.is_empty() {
            return Err(Error::Config(
                "namespace, stream, and consumer_group must be non-empty".into(),
            ));
        }
        let store = self
            .store
            .ok_or_else(|| Error::Config("a checkpoint store is required".into()))?;
        let source = self
            .source
            .ok_or_else(|| Error::Config("a partition source is required".into()))?;

        let mode = match (self.event_handler, self.batch_handler) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "event_handler and batch_handler are mutually exclusive".into(),
                ));
            }
            (None, None) => {
                return Err(Error::Config(
                    "either an event_handler or a batch_handler is required".into(),
                ));
            }
            (Some(handler), None) => HandlerMode::Single(handler),
            (None, Some((handler, max_batch_size, max_wait))) => {
                if max_batch_size == 0 {
                    return Err(Error::Config("max_batch_size must be at least 1".into()));
                }
                HandlerMode::Batch {
                    handler,
                    max_batch_size,
                    max_wait,
                }
            }
        };

        self.load_balancer.validate()?;

        Ok(EventProcessor {
            inner: Arc::new(EngineInner {
                namespace: self.namespace,
                stream: self.stream,
                consumer_group: self.consumer_group,
                owner_id: self.owner_id.unwrap_or_else(default_owner_id),
                store,
                source,
                mode,
                error_handler: self
                    .error_handler
                    .unwrap_or_else(|| Arc::new(LoggingErrorHandler)),
                lb_config: self.load_balancer,
                default_start_position: self.default_start_position,
                pump_stop_timeout: self.pump_stop_timeout,
                pumps: Mutex::new(HashMap::new()),
                tick_lock: Mutex::new(()),
                running: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                owned: std::sync::RwLock::new(HashSet::new()),
                relinquished: std::sync::Mutex::new(HashSet::new()),
            }),
            tasks: Mutex::new(TaskRegistry::new()),
        })
    }
}

struct EngineInner {
    namespace: String,
    stream: String,
    consumer_group: String,
    owner_id: String,
    store: Arc<dyn CheckpointStore>,
    source: Arc<dyn PartitionSource>,
    mode: HandlerMode,
    error_handler: Arc<dyn ErrorHandler>,
    lb_config: LoadBalancerConfig,
    default_start_position: StartPosition,
    pump_stop_timeout: Duration,
    /// Live pumps keyed by partition. Held only for map surgery, never
    /// across store or source I/O.
    pumps: Mutex<HashMap<PartitionId, PartitionPump>>,
    /// Non-reentrancy guard for balancing ticks.
    tick_lock: Mutex<()>,
    running: AtomicBool,
    ticks: AtomicU64,
    /// Introspection snapshot of owned partitions, refreshed per tick.
    owned: std::sync::RwLock<HashSet<PartitionId>>,
    /// Partitions whose pumps exited on their own. Their leases are not
    /// renewed and must not be reclaimed until they expire or another owner
    /// takes them.
    relinquished: std::sync::Mutex<HashSet<PartitionId>>,
}

/// A cooperating partition consumer.
///
/// Construct through [`EventProcessorBuilder`], then call
/// [`start`](Self::start). Several instances sharing a store, stream, and
/// consumer group divide the partitions among themselves without any central
/// coordinator.
pub struct EventProcessor {
    inner: Arc<EngineInner>,
    tasks: Mutex<TaskRegistry>,
}

impl EventProcessor {
    pub fn builder(
        namespace: impl Into<String>,
        stream: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> EventProcessorBuilder {
        EventProcessorBuilder::new(namespace, stream, consumer_group)
    }

    /// Identity this instance competes under.
    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Balancing ticks completed since [`start`](Self::start).
    pub fn tick_count(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// Partitions owned as of the last completed tick.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let owned = self.inner.owned.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<PartitionId> = owned.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Status of each engine background task, by name.
    ///
    /// Empty before [`start`](Self::start) and after [`stop`](Self::stop).
    pub async fn task_health(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks.lock().await.health_check()
    }

    /// Begin competing for partitions and processing events.
    ///
    /// Queries the partition set once, then runs the balancing timer until
    /// [`stop`](Self::stop). Calling `start` on a running engine is an error.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState("processor is already running".into()));
        }

        let partitions = match self.inner.source.partition_ids().await {
            Ok(partitions) => partitions,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        if partitions.is_empty() {
            self.inner.running.store(false, Ordering::Release);
            return Err(Error::Config("stream reports no partitions".into()));
        }

        info!(
            owner = %self.inner.owner_id,
            stream = %self.inner.stream,
            consumer_group = %self.inner.consumer_group,
            partitions = partitions.len(),
            "Starting event processor"
        );

        let balancer = Arc::new(LoadBalancer::new(
            self.inner.namespace.clone(),
            self.inner.stream.clone(),
            self.inner.consumer_group.clone(),
            self.inner.owner_id.clone(),
            self.inner.lb_config.clone(),
            self.inner.store.clone(),
            partitions,
        ));

        let inner = self.inner.clone();
        let interval = self.inner.lb_config.update_interval;
        let mut tasks = self.tasks.lock().await;
        tasks.spawn("load-balancer", async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                let Ok(_guard) = inner.tick_lock.try_lock() else {
                    debug!(owner = %inner.owner_id, "Balancing tick still running; skipping");
                    continue;
                };
                run_tick(&inner, &balancer).await;
            }
        });

        Ok(())
    }

    /// Stop the balancing timer and every pump, waiting for each pump's loop
    /// to exit (or detach at the soft timeout). Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(owner = %self.inner.owner_id, "Stopping event processor");

        // Timer first, so no tick starts new pumps underneath the drain.
        self.tasks.lock().await.shutdown_all().await;

        let drained: Vec<PartitionPump> = {
            let mut pumps = self.inner.pumps.lock().await;
            pumps.drain().map(|(_, pump)| pump).collect()
        };
        let mut joins = Vec::with_capacity(drained.len());
        for mut pump in drained {
            joins.push(tokio::spawn(async move { pump.stop().await }));
        }
        for join in joins {
            let _ = join.await;
        }

        self.inner
            .owned
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner
            .relinquished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        // The registry was consumed by shutdown; arm a fresh one so the
        // engine can be started again.
        *self.tasks.lock().await = TaskRegistry::new();
    }
}

async fn run_tick(inner: &Arc<EngineInner>, balancer: &Arc<LoadBalancer>) {
    inner.ticks.fetch_add(1, Ordering::Relaxed);

    // Reap pumps that exited on their own so their leases lapse.
    let finished: Vec<PartitionPump> = {
        let mut pumps = inner.pumps.lock().await;
        let stopped: Vec<PartitionId> = pumps
            .iter()
            .filter(|(_, pump)| pump.is_finished())
            .map(|(partition, _)| partition.clone())
            .collect();
        stopped
            .iter()
            .filter_map(|partition| pumps.remove(partition))
            .collect()
    };
    for mut pump in finished {
        debug!(partition = %pump.partition_id(), "Reaping finished pump");
        inner
            .relinquished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pump.partition_id().clone());
        pump.stop().await;
    }
    let relinquish = inner
        .relinquished
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let outcome = match balancer.tick(&relinquish).await {
        Ok(outcome) => outcome,
        Err(e) => {
            report_scoped(
                &inner.error_handler,
                &inner.namespace,
                &inner.stream,
                &inner.consumer_group,
                PARTITION_ID_NONE,
                Error::Store(e),
            )
            .await;
            return;
        }
    };

    if !outcome.released.is_empty() {
        let mut relinquished = inner
            .relinquished
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for partition in &outcome.released {
            relinquished.remove(partition);
        }
    }

    let owned: HashSet<PartitionId> = outcome
        .owned
        .iter()
        .map(|o| o.partition_id.clone())
        .collect();

    let (to_start, to_stop) = {
        let pumps = inner.pumps.lock().await;
        let to_start: Vec<PartitionId> = owned
            .iter()
            .filter(|partition| !pumps.contains_key(*partition))
            .cloned()
            .collect();
        let to_stop: Vec<PartitionId> = pumps
            .keys()
            .filter(|partition| !owned.contains(*partition))
            .cloned()
            .collect();
        (to_start, to_stop)
    };

    if !to_start.is_empty() {
        start_pumps(inner, to_start).await;
    }

    for partition in to_stop {
        let pump = inner.pumps.lock().await.remove(&partition);
        if let Some(mut pump) = pump {
            info!(partition = %partition, "Ownership lost; stopping pump");
            pump.stop().await;
        }
    }

    let mut view = inner.owned.write().unwrap_or_else(|e| e.into_inner());
    *view = owned;
}

async fn start_pumps(inner: &Arc<EngineInner>, partitions: Vec<PartitionId>) {
    let checkpoints = match inner
        .store
        .list_checkpoints(&inner.namespace, &inner.stream, &inner.consumer_group)
        .await
    {
        Ok(checkpoints) => checkpoints,
        Err(e) => {
            // Starting blind would replay from the default position and
            // violate resume semantics; hold off until the store recovers.
            report_scoped(
                &inner.error_handler,
                &inner.namespace,
                &inner.stream,
                &inner.consumer_group,
                PARTITION_ID_NONE,
                Error::Store(e),
            )
            .await;
            return;
        }
    };
    let by_partition: HashMap<&PartitionId, &Checkpoint> = checkpoints
        .iter()
        .map(|c| (&c.partition_id, c))
        .collect();

    for partition in partitions {
        let position = resume_position(
            by_partition.get(&partition).copied(),
            inner.default_start_position,
        );
        let context = Arc::new(PartitionContext::new(
            inner.namespace.clone(),
            inner.stream.clone(),
            inner.consumer_group.clone(),
            partition.clone(),
            inner.owner_id.clone(),
            inner.store.clone(),
        ));
        let pump = PartitionPump::start(
            context,
            inner.source.clone(),
            position,
            inner.mode.clone(),
            inner.error_handler.clone(),
            inner.pump_stop_timeout,
        );
        inner.pumps.lock().await.insert(partition, pump);
    }
}

/// Map a recovered checkpoint to the position consumption resumes from.
///
/// Offset wins over sequence number when both are present; either resumes
/// *after* the checkpointed event. Without a usable checkpoint the
/// configured default applies.
fn resume_position(checkpoint: Option<&Checkpoint>, default: StartPosition) -> StartPosition {
    match checkpoint {
        Some(c) if c.offset.is_valid() => StartPosition::Offset(c.offset),
        Some(c) if c.sequence_number.value() >= 0 => StartPosition::Sequence(c.sequence_number),
        _ => default,
    }
}
