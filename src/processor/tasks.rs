//! Background task registry for engine-owned loops.
//!
//! The engine runs a small set of named background tasks (currently the
//! load-balancer timer). This registry centralizes their lifecycle:
//! consistent shutdown semantics via a broadcast signal, plus a health view
//! for introspection. Tasks are cooperative; shutdown wins the `select!`
//! inside each spawned wrapper.

use std::collections::HashMap;
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is currently running.
    Running,
    /// Task completed or was stopped via shutdown.
    Stopped,
}

struct TaskInfo {
    handle: JoinHandle<()>,
}

/// Central registry for engine background tasks.
pub(crate) struct TaskRegistry {
    tasks: HashMap<&'static str, TaskInfo>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl TaskRegistry {
    pub(crate) fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named task that exits when the registry shuts down.
    pub(crate) fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }

        if let Some(old) = self.tasks.remove(name) {
            old.handle.abort();
            debug!(task = name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    debug!(task = name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    debug!(task = name, "Task received shutdown signal");
                }
            }
        });

        info!(task = name, "Spawned background task");
        self.tasks.insert(name, TaskInfo { handle });
    }

    /// Current status per registered task.
    pub(crate) fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks
            .iter()
            .map(|(name, info)| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Stopped
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect()
    }

    /// Signal shutdown and wait for every task to exit.
    pub(crate) async fn shutdown_all(&mut self) {
        self.shutting_down = true;
        let _ = self.shutdown_tx.send(());

        for (name, info) in self.tasks.drain() {
            if let Err(e) = info.handle.await {
                if !e.is_cancelled() {
                    warn!(task = name, error = %e, "Background task ended abnormally");
                }
            }
        }
        debug!("All background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let mut registry = TaskRegistry::new();
        let count = Arc::new(AtomicU32::new(0));

        let task_count = count.clone();
        registry.spawn("ticker", async move {
            loop {
                task_count.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.shutdown_all().await;

        let after = count.load(Ordering::SeqCst);
        assert!(after > 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_health_check_reports_running() {
        let mut registry = TaskRegistry::new();
        registry.spawn("idle", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let health = registry.health_check();
        assert_eq!(health, vec![("idle", TaskStatus::Running)]);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_is_ignored() {
        let mut registry = TaskRegistry::new();
        registry.shutdown_all().await;
        registry.spawn("late", async {});
        assert!(registry.health_check().is_empty());
    }
}
