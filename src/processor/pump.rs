//! Partition pump: one partition's live consumption loop.
//!
//! A pump bridges the consumption source to the processor callbacks. Delivery
//! is synchronous with respect to the partition: event `N + 1` is never
//! handed to the handler before the callback for event `N` has returned,
//! which is what preserves per-partition ordering.
//!
//! A pump stops for one of three reasons:
//!
//! - the engine asked it to (ownership loss or shutdown),
//! - the source ended or failed,
//! - the handler returned a non-transient error.
//!
//! In every case the pump does **not** release its lease in the store; it
//! simply stops, the load balancer stops renewing the partition, and the
//! lease expires naturally for other owners to claim.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handler::{ErrorContext, ErrorHandler, HandlerMode, PartitionContext};
use super::source::{EventReader, PartitionSource, ReceivedEvent, StartPosition};
use crate::error::Error;
use crate::types::PartitionId;

/// Handle to one running partition consumption loop.
pub(crate) struct PartitionPump {
    partition_id: PartitionId,
    context: Arc<PartitionContext>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    finished: Arc<AtomicBool>,
    stop_timeout: Duration,
}

impl PartitionPump {
    /// Spawn the consumption loop for `partition_id` starting at `position`.
    pub(crate) fn start(
        context: Arc<PartitionContext>,
        source: Arc<dyn PartitionSource>,
        position: StartPosition,
        mode: HandlerMode,
        error_handler: Arc<dyn ErrorHandler>,
        stop_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let finished = Arc::new(AtomicBool::new(false));
        let partition_id = context.partition_id().clone();

        let loop_ctx = context.clone();
        let loop_finished = finished.clone();
        let handle = tokio::spawn(async move {
            run_pump_loop(loop_ctx, source, position, mode, error_handler, shutdown_rx).await;
            loop_finished.store(true, Ordering::Release);
        });

        info!(partition = %partition_id, ?position, "Partition pump started");

        Self {
            partition_id,
            context,
            shutdown_tx,
            handle: Some(handle),
            finished,
            stop_timeout,
        }
    }

    /// Whether the loop has exited on its own (source ended, handler error).
    ///
    /// The load balancer prunes finished pumps each tick and stops renewing
    /// their partitions.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Request cooperative cancellation and wait for the loop to exit.
    ///
    /// Idempotent: a second call is a no-op. If the loop does not exit
    /// within the soft timeout the task is detached, not aborted, so an
    /// in-flight checkpoint write is never corrupted.
    pub(crate) async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.context.cancel();
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(self.stop_timeout, handle).await {
            Ok(_) => {
                debug!(partition = %self.partition_id, "Partition pump stopped");
            }
            Err(_) => {
                // Detached: the task keeps its context alive until it exits.
                warn!(
                    partition = %self.partition_id,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Partition pump did not stop in time; detaching"
                );
            }
        }
    }
}

async fn run_pump_loop(
    ctx: Arc<PartitionContext>,
    source: Arc<dyn PartitionSource>,
    position: StartPosition,
    mode: HandlerMode,
    error_handler: Arc<dyn ErrorHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reader = match source.open(ctx.partition_id(), position).await {
        Ok(reader) => reader,
        Err(e) => {
            report(&error_handler, &ctx, e).await;
            return;
        }
    };

    match mode {
        HandlerMode::Single(handler) => {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    event = reader.recv() => event,
                };

                match event {
                    Ok(Some(event)) => {
                        ctx.record_delivery(&event);
                        if let Err(e) = handler.process_event(&ctx, event).await {
                            let transient = e.is_transient();
                            report(&error_handler, &ctx, e).await;
                            if !transient {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(partition = %ctx.partition_id(), "Partition stream ended");
                        break;
                    }
                    Err(e) => {
                        report(&error_handler, &ctx, e).await;
                        break;
                    }
                }
            }
        }
        HandlerMode::Batch {
            handler,
            max_batch_size,
            max_wait,
        } => {
            loop {
                let (batch, stopping) = collect_batch(
                    reader.as_mut(),
                    &mut shutdown_rx,
                    max_batch_size,
                    max_wait,
                    &ctx,
                    &error_handler,
                )
                .await;

                if !batch.is_empty() {
                    if let Some(last) = batch.last() {
                        ctx.record_delivery(last);
                    }
                    if let Err(e) = handler.process_batch(&ctx, batch).await {
                        let transient = e.is_transient();
                        report(&error_handler, &ctx, e).await;
                        if !transient {
                            break;
                        }
                    }
                }

                if stopping {
                    break;
                }
            }
        }
    }
}

/// Accumulate up to `max_batch_size` events, flushing early once `max_wait`
/// elapses with a non-empty buffer. Returns the batch and whether the loop
/// should stop afterwards.
async fn collect_batch(
    reader: &mut dyn EventReader,
    shutdown_rx: &mut watch::Receiver<bool>,
    max_batch_size: usize,
    max_wait: Duration,
    ctx: &Arc<PartitionContext>,
    error_handler: &Arc<dyn ErrorHandler>,
) -> (Vec<ReceivedEvent>, bool) {
    let mut batch: Vec<ReceivedEvent> = Vec::with_capacity(max_batch_size);
    let deadline = tokio::time::Instant::now() + max_wait;

    while batch.len() < max_batch_size {
        let event = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return (batch, true),
            _ = tokio::time::sleep_until(deadline), if !batch.is_empty() => break,
            event = reader.recv() => event,
        };

        match event {
            Ok(Some(event)) => batch.push(event),
            Ok(None) => {
                debug!(partition = %ctx.partition_id(), "Partition stream ended");
                return (batch, true);
            }
            Err(e) => {
                report(error_handler, ctx, e).await;
                return (batch, true);
            }
        }
    }

    (batch, false)
}

async fn report(error_handler: &Arc<dyn ErrorHandler>, ctx: &Arc<PartitionContext>, error: Error) {
    warn!(partition = %ctx.partition_id(), error = %error, "Partition pump error");
    error_handler
        .process_error(ErrorContext {
            namespace: ctx.namespace().to_string(),
            stream: ctx.stream().to_string(),
            consumer_group: ctx.consumer_group().to_string(),
            partition_id: ctx.partition_id().clone(),
            error,
        })
        .await;
}

/// Convenience used by the engine to surface tick-level failures through the
/// same callback path as pump failures.
pub(crate) async fn report_scoped(
    error_handler: &Arc<dyn ErrorHandler>,
    namespace: &str,
    stream: &str,
    consumer_group: &str,
    partition_id: &str,
    error: Error,
) {
    error_handler
        .process_error(ErrorContext {
            namespace: namespace.to_string(),
            stream: stream.to_string(),
            consumer_group: consumer_group.to_string(),
            partition_id: partition_id.to_string(),
            error,
        })
        .await;
}
