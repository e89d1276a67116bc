/// Queue scheduler: polls for queued tasks and dispatches full workflow
/// runs, subject to the global concurrency ceiling.
///
/// The scheduler is a fixed-interval poll loop, not a notify-driven wakeup:
/// a task queued between ticks waits at most one interval, which is cheap
/// next to multi-minute agent invocations. Every tick is independent and
/// every error inside a tick is logged and absorbed so the loop never dies.
use crate::errors::EngineError;
use crate::sequencer::WorkflowSequencer;
use crate::store::SqliteTaskStore;
use crate::task::{self, TaskStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polls the queue and dispatches workflows until shut down.
pub struct QueueScheduler {
    store: Arc<SqliteTaskStore>,
    sequencer: Arc<WorkflowSequencer>,
    poll_interval: Duration,
    max_concurrent: usize,
    ticking: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl QueueScheduler {
    pub fn new(
        store: Arc<SqliteTaskStore>,
        sequencer: Arc<WorkflowSequencer>,
        poll_interval_ms: u64,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            sequencer,
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_concurrent,
            ticking: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the poll loop. The returned handle finishes after
    /// [`QueueScheduler::shutdown`] is called.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            max_concurrent = self.max_concurrent,
            "Starting queue scheduler"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => scheduler.tick().await,
                    _ = scheduler.shutdown.cancelled() => {
                        info!("Queue scheduler stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Stop the poll loop. In-flight workflow runs are not cancelled; use
    /// the sequencer's `stop` for that.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// One scheduling pass: skip if a previous tick is still deciding,
    /// enforce the concurrency ceiling, pick the highest-priority queued
    /// task, and dispatch it as a detached full workflow.
    pub async fn tick(&self) {
        // Re-entrancy guard; overlapping passes could double-dispatch.
        if self.ticking.swap(true, Ordering::SeqCst) {
            debug!("Previous scheduler pass still running, skipping tick");
            return;
        }
        if let Err(e) = self.dispatch_pass().await {
            error!("Scheduler pass failed: {}", e);
        }
        self.ticking.store(false, Ordering::SeqCst);
    }

    async fn dispatch_pass(&self) -> Result<(), EngineError> {
        let active = self.store.count_active().await?;
        if active >= self.max_concurrent {
            debug!(active, ceiling = self.max_concurrent, "Concurrency ceiling reached");
            return Ok(());
        }

        let mut queued = self.store.list_by_status(TaskStatus::Queued).await?;
        if queued.is_empty() {
            return Ok(());
        }
        task::sort_queue(&mut queued);

        // Admit one task per tick; the next tick re-evaluates the ceiling
        // against the database rather than trusting in-memory bookkeeping.
        for candidate in queued {
            // A run can already be attached if the status update raced a
            // manual step trigger.
            if self.sequencer.is_active(candidate.id) {
                continue;
            }
            info!(task_id = candidate.id, priority = %candidate.priority, "Dispatching queued task");
            let sequencer = Arc::clone(&self.sequencer);
            let task_id = candidate.id;
            tokio::spawn(async move {
                match sequencer.run_full_workflow(task_id).await {
                    Ok(outcome) => {
                        debug!(task_id, ?outcome, "Workflow run finished");
                    }
                    Err(EngineError::ConcurrentStepConflict { .. }) => {
                        warn!(task_id, "Task already had an active run, skipped");
                    }
                    Err(e) => {
                        error!(task_id, "Workflow run failed: {}", e);
                    }
                }
            });
            return Ok(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::invoker::{AgentInvoker, Invocation, InvocationOutcome, InvocationRequest};
    use crate::ledger::LedgerStore;
    use crate::prompts::FileTemplateProvider;
    use crate::task::TaskPriority;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records invocations and succeeds immediately.
    struct RecordingInvoker {
        calls: Mutex<Vec<(i64, crate::task::WorkflowStep)>>,
    }

    impl RecordingInvoker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(i64, crate::task::WorkflowStep)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            request: InvocationRequest,
            _cancel: CancellationToken,
        ) -> crate::errors::InvokerResult<Invocation> {
            self.calls.lock().unwrap().push((request.task_id, request.step));
            Ok(Invocation {
                outcome: InvocationOutcome::Exited {
                    code: Some(0),
                    success: true,
                },
                tail: vec![],
            })
        }
    }

    async fn harness(
        max_concurrent: usize,
    ) -> (
        tempfile::TempDir,
        Arc<SqliteTaskStore>,
        Arc<RecordingInvoker>,
        Arc<QueueScheduler>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SqliteTaskStore::new(dir.path().join("test.db")).await.unwrap(),
        );
        let invoker = Arc::new(RecordingInvoker::new());
        let sequencer = Arc::new(WorkflowSequencer::new(
            Arc::clone(&store),
            LedgerStore::new(dir.path()),
            Arc::clone(&invoker) as Arc<dyn AgentInvoker>,
            Arc::new(FileTemplateProvider::new(dir.path())),
            Arc::new(EventBus::new()),
            5,
        ));
        let scheduler = Arc::new(QueueScheduler::new(
            Arc::clone(&store),
            sequencer,
            50,
            max_concurrent,
        ));
        (dir, store, invoker, scheduler)
    }

    async fn wait_for_status(store: &SqliteTaskStore, id: i64, status: TaskStatus) {
        for _ in 0..100 {
            let task = store.get_task(id).await.unwrap().unwrap();
            if task.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} never reached status {}", id, status);
    }

    #[tokio::test]
    async fn test_tick_dispatches_highest_priority_first() {
        let (_dir, store, invoker, scheduler) = harness(1).await;

        let low = store
            .create_task("low", None, TaskPriority::Low)
            .await
            .unwrap();
        let high = store
            .create_task("high", None, TaskPriority::High)
            .await
            .unwrap();
        store.set_status(low.id, TaskStatus::Queued).await.unwrap();
        store.set_status(high.id, TaskStatus::Queued).await.unwrap();

        scheduler.tick().await;
        wait_for_status(&store, high.id, TaskStatus::Review).await;

        // The earlier-queued low task must not have been touched.
        let low = store.get_task(low.id).await.unwrap().unwrap();
        assert_eq!(low.status, TaskStatus::Queued);
        assert!(invoker.calls().iter().all(|(id, _)| *id == high.id));
    }

    #[tokio::test]
    async fn test_ceiling_blocks_admission() {
        let (_dir, store, invoker, scheduler) = harness(1).await;

        let busy = store
            .create_task("busy", None, TaskPriority::Medium)
            .await
            .unwrap();
        store.set_status(busy.id, TaskStatus::Running).await.unwrap();

        let queued = store
            .create_task("waiting", None, TaskPriority::High)
            .await
            .unwrap();
        store.set_status(queued.id, TaskStatus::Queued).await.unwrap();

        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(invoker.calls().is_empty());
        let task = store.get_task(queued.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_no_op() {
        let (_dir, _store, invoker, scheduler) = harness(1).await;
        scheduler.tick().await;
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (_dir, store, _invoker, scheduler) = harness(1).await;

        let task = store
            .create_task("queued", None, TaskPriority::Medium)
            .await
            .unwrap();
        store.set_status(task.id, TaskStatus::Queued).await.unwrap();

        let handle = scheduler.start();
        wait_for_status(&store, task.id, TaskStatus::Review).await;

        scheduler.shutdown();
        handle.await.unwrap();
    }
}
