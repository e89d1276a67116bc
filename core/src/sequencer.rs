/// Workflow sequencer: drives one task through brief -> plan -> execute.
///
/// Each step is one agent invocation, except execute, which runs the
/// iterative loop: invoke, re-read the subtask ledger, and invoke again with
/// the unfinished subtasks until everything is completed/skipped or the
/// iteration budget runs out. Step outcomes are translated into task
/// status/workflow-step transitions; nothing here escapes as a panic.
use crate::errors::{EngineError, EngineResult, InvokerError};
use crate::events::{EventBus, StreamEventKind, TaskStreamEvent};
use crate::invoker::{AgentInvoker, InvocationOutcome, InvocationRequest};
use crate::ledger::{LedgerStore, Subtask};
use crate::prompts::{build_step_prompt, TemplateProvider};
use crate::store::SqliteTaskStore;
use crate::task::{Task, TaskStatus, WorkflowStep};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why a step failed. The configuration variant gets a distinct,
/// actionable user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Agent binary missing or unspawnable; fix the config, don't retry.
    Configuration,
    /// Agent exited non-zero.
    Exit,
    /// Invocation hit the per-step timeout.
    Timeout,
    /// An explicit stop request cancelled the run.
    Cancelled,
}

/// Outcome of running one step (or a full workflow).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step finished; the task's workflow step advanced.
    Completed,
    /// The execute loop exhausted its iteration budget. Soft success: the
    /// task still reaches review so partial work is never lost, but the
    /// outcome is flagged incomplete in the logs and event stream.
    CompletedIncomplete { iterations: u32 },
    /// The step failed; the task is back in todo and can be re-run.
    Failed { kind: FailureKind, reason: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, StepOutcome::Failed { .. })
    }
}

/// An in-memory workflow run. Its presence in the registry is the per-task
/// mutex; it exists only while a step's process may be alive.
struct ActiveRun {
    step: WorkflowStep,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Snapshot of an active run for callers (delete/stop endpoints).
#[derive(Debug, Clone)]
pub struct ActiveRunInfo {
    pub task_id: i64,
    pub step: WorkflowStep,
    pub started_at: DateTime<Utc>,
}

/// Drives tasks through the three-stage workflow.
pub struct WorkflowSequencer {
    store: Arc<SqliteTaskStore>,
    ledger: LedgerStore,
    invoker: Arc<dyn AgentInvoker>,
    templates: Arc<dyn TemplateProvider>,
    events: Arc<EventBus>,
    max_iterations: u32,
    active: DashMap<i64, ActiveRun>,
}

impl WorkflowSequencer {
    pub fn new(
        store: Arc<SqliteTaskStore>,
        ledger: LedgerStore,
        invoker: Arc<dyn AgentInvoker>,
        templates: Arc<dyn TemplateProvider>,
        events: Arc<EventBus>,
        max_iterations: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            invoker,
            templates,
            events,
            max_iterations,
            active: DashMap::new(),
        }
    }

    /// Whether a workflow run is attached to this task right now.
    pub fn is_active(&self, task_id: i64) -> bool {
        self.active.contains_key(&task_id)
    }

    /// Snapshot of all attached runs.
    pub fn active_runs(&self) -> Vec<ActiveRunInfo> {
        self.active
            .iter()
            .map(|entry| ActiveRunInfo {
                task_id: *entry.key(),
                step: entry.value().step,
                started_at: entry.value().started_at,
            })
            .collect()
    }

    /// Request cancellation of the task's attached run, if any. The process
    /// gets SIGTERM, then SIGKILL after the grace window; partial file
    /// effects are not rolled back. Returns whether a run was attached.
    pub fn stop(&self, task_id: i64) -> bool {
        match self.active.get(&task_id) {
            Some(run) => {
                info!(task_id, "Stop requested, cancelling active run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a single workflow step. Fails fast with
    /// [`EngineError::ConcurrentStepConflict`] if a run is already attached.
    /// On success the task returns to `todo` so a human (or the queue) can
    /// trigger the next stage.
    pub async fn run_step(&self, task_id: i64, step: WorkflowStep) -> EngineResult<StepOutcome> {
        if !matches!(
            step,
            WorkflowStep::Brief | WorkflowStep::Plan | WorkflowStep::Execute
        ) {
            return Err(EngineError::Configuration(format!(
                "'{}' is not a runnable workflow step",
                step
            )));
        }

        let cancel = self.attach(task_id, step)?;
        let result = match step {
            WorkflowStep::Execute => self.run_execute_loop(task_id, &cancel).await,
            _ => self.run_single_step(task_id, step, &cancel, false).await,
        };
        self.active.remove(&task_id);
        result
    }

    /// Run brief -> plan -> execute end to end, short-circuiting to failure
    /// if brief or plan fails. The run stays attached across all three
    /// stages so no second workflow can slip in between steps.
    pub async fn run_full_workflow(&self, task_id: i64) -> EngineResult<StepOutcome> {
        let cancel = self.attach(task_id, WorkflowStep::Brief)?;
        let result = self.run_full_attached(task_id, &cancel).await;
        self.active.remove(&task_id);
        result
    }

    async fn run_full_attached(
        &self,
        task_id: i64,
        cancel: &CancellationToken,
    ) -> EngineResult<StepOutcome> {
        for step in [WorkflowStep::Brief, WorkflowStep::Plan] {
            self.set_active_step(task_id, step);
            let outcome = self.run_single_step(task_id, step, cancel, true).await?;
            if !outcome.is_success() {
                return Ok(outcome);
            }
        }
        self.set_active_step(task_id, WorkflowStep::Execute);
        self.run_execute_loop(task_id, cancel).await
    }

    fn attach(&self, task_id: i64, step: WorkflowStep) -> EngineResult<CancellationToken> {
        match self.active.entry(task_id) {
            Entry::Occupied(_) => Err(EngineError::ConcurrentStepConflict { task_id }),
            Entry::Vacant(vacant) => {
                let cancel = CancellationToken::new();
                vacant.insert(ActiveRun {
                    step,
                    cancel: cancel.clone(),
                    started_at: Utc::now(),
                });
                Ok(cancel)
            }
        }
    }

    fn set_active_step(&self, task_id: i64, step: WorkflowStep) {
        if let Some(mut run) = self.active.get_mut(&task_id) {
            run.step = step;
        }
    }

    async fn load_task(&self, task_id: i64) -> EngineResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(EngineError::StoreError(
                crate::errors::StoreError::TaskNotFound(task_id),
            ))
    }

    /// One brief/plan invocation. In chained (full-workflow) mode a success
    /// does not bounce the status through `todo` between stages.
    async fn run_single_step(
        &self,
        task_id: i64,
        step: WorkflowStep,
        cancel: &CancellationToken,
        chained: bool,
    ) -> EngineResult<StepOutcome> {
        let task = self.load_task(task_id).await?;
        self.store.set_status(task_id, step.running_status()).await?;
        info!(task_id, step = %step, "Starting workflow step");

        let prompt = build_step_prompt(step, &task, self.templates.template_for(step), &[]);
        let invocation = match self
            .invoker
            .invoke(
                InvocationRequest {
                    task_id,
                    step,
                    prompt,
                },
                cancel.clone(),
            )
            .await
        {
            Ok(invocation) => invocation,
            Err(e) => return self.fail_step(task_id, step, spawn_failure(&e)).await,
        };

        if !invocation.tail.is_empty() {
            self.store.append_log(task_id, step, &invocation.tail).await?;
        }

        match invocation.outcome {
            InvocationOutcome::Exited { success: true, .. } => {
                self.store.set_workflow_step(task_id, step).await?;
                if !chained {
                    self.store.set_status(task_id, TaskStatus::Todo).await?;
                }
                self.emit(task_id, step, StreamEventKind::Exit, "exit code 0".to_string());
                info!(task_id, step = %step, "Workflow step completed");
                Ok(StepOutcome::Completed)
            }
            InvocationOutcome::Exited { code, .. } => {
                self.fail_step(
                    task_id,
                    step,
                    (
                        FailureKind::Exit,
                        format!("agent exited with code {}", code.map_or_else(|| "unknown".to_string(), |c| c.to_string())),
                    ),
                )
                .await
            }
            InvocationOutcome::TimedOut => {
                self.fail_step(task_id, step, (FailureKind::Timeout, "step timed out".to_string()))
                    .await
            }
            InvocationOutcome::Cancelled => {
                self.fail_step(
                    task_id,
                    step,
                    (FailureKind::Cancelled, "step stopped by user".to_string()),
                )
                .await
            }
        }
    }

    /// The iterative execute loop. Invokes the agent up to `max_iterations`
    /// times, re-reading the subtask ledger between invocations. A missing
    /// or malformed ledger counts as complete: tasks without structured
    /// subtasks finish after a single successful invocation.
    async fn run_execute_loop(
        &self,
        task_id: i64,
        cancel: &CancellationToken,
    ) -> EngineResult<StepOutcome> {
        self.store.set_status(task_id, TaskStatus::Running).await?;
        self.store
            .set_workflow_step(task_id, WorkflowStep::Execute)
            .await?;

        let step = WorkflowStep::Execute;
        for iteration in 1..=self.max_iterations {
            let task = self.load_task(task_id).await?;
            info!(task_id, iteration, "Starting execute iteration");

            // Pull unfinished subtasks fresh from the ledger so iteration > 1
            // prompts carry targeted, shrinking feedback.
            let remaining: Vec<Subtask> = if iteration > 1 {
                match self.ledger.load(&task.docs_path).await {
                    Ok(Some(ledger)) => ledger.remaining().into_iter().cloned().collect(),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        warn!(task_id, "Could not read subtask ledger: {}", e);
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            let remaining_refs: Vec<&Subtask> = remaining.iter().collect();
            let prompt = build_step_prompt(
                step,
                &task,
                self.templates.template_for(step),
                &remaining_refs,
            );

            let invocation = match self
                .invoker
                .invoke(
                    InvocationRequest {
                        task_id,
                        step,
                        prompt,
                    },
                    cancel.clone(),
                )
                .await
            {
                Ok(invocation) => invocation,
                Err(e) => return self.fail_step(task_id, step, spawn_failure(&e)).await,
            };

            if !invocation.tail.is_empty() {
                self.store.append_log(task_id, step, &invocation.tail).await?;
            }

            // A failed invocation aborts the loop; iterating on top of a
            // failed step would only compound the damage.
            match invocation.outcome {
                InvocationOutcome::Exited { success: true, .. } => {}
                InvocationOutcome::Exited { code, .. } => {
                    return self
                        .fail_step(
                            task_id,
                            step,
                            (
                                FailureKind::Exit,
                                format!(
                                    "agent exited with code {} on iteration {}",
                                    code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                                    iteration
                                ),
                            ),
                        )
                        .await;
                }
                InvocationOutcome::TimedOut => {
                    return self
                        .fail_step(
                            task_id,
                            step,
                            (
                                FailureKind::Timeout,
                                format!("step timed out on iteration {}", iteration),
                            ),
                        )
                        .await;
                }
                InvocationOutcome::Cancelled => {
                    return self
                        .fail_step(
                            task_id,
                            step,
                            (FailureKind::Cancelled, "step stopped by user".to_string()),
                        )
                        .await;
                }
            }

            let task = self.load_task(task_id).await?;
            let complete = match self.ledger.load(&task.docs_path).await {
                Ok(Some(ledger)) => ledger.is_all_complete(),
                Ok(None) => true,
                Err(e) => {
                    warn!(
                        task_id,
                        "Malformed subtask ledger, treating task as complete: {}", e
                    );
                    true
                }
            };

            if complete {
                self.store
                    .set_workflow_step(task_id, WorkflowStep::Complete)
                    .await?;
                self.store.set_status(task_id, TaskStatus::Review).await?;
                self.emit(
                    task_id,
                    step,
                    StreamEventKind::Exit,
                    format!("completed after {} iteration(s)", iteration),
                );
                info!(task_id, iteration, "Execute loop completed");
                return Ok(StepOutcome::Completed);
            }
        }

        // Budget exhausted: advance to review anyway so a human can inspect
        // partial progress instead of the task hogging the concurrency slot.
        let message = format!(
            "execute loop ended incomplete after {} iterations",
            self.max_iterations
        );
        warn!(task_id, "{}", message);
        self.store.append_log(task_id, step, &[message.clone()]).await?;
        self.store
            .set_workflow_step(task_id, WorkflowStep::Complete)
            .await?;
        self.store.set_status(task_id, TaskStatus::Review).await?;
        self.emit(task_id, step, StreamEventKind::Error, message);
        Ok(StepOutcome::CompletedIncomplete {
            iterations: self.max_iterations,
        })
    }

    /// Absorb a failure into task state: back to `todo`, log line under the
    /// step, error event. The workflow step is left at whatever last
    /// completed so a retry resumes with context.
    async fn fail_step(
        &self,
        task_id: i64,
        step: WorkflowStep,
        (kind, reason): (FailureKind, String),
    ) -> EngineResult<StepOutcome> {
        warn!(task_id, step = %step, "Workflow step failed: {}", reason);
        self.store.set_status(task_id, TaskStatus::Todo).await?;
        self.store.append_log(task_id, step, &[reason.clone()]).await?;
        self.emit(task_id, step, StreamEventKind::Error, reason.clone());
        Ok(StepOutcome::Failed { kind, reason })
    }

    fn emit(&self, task_id: i64, step: WorkflowStep, kind: StreamEventKind, data: String) {
        self.events
            .publish(TaskStreamEvent::new(task_id, step, kind, data));
    }
}

fn spawn_failure(error: &InvokerError) -> (FailureKind, String) {
    match error {
        InvokerError::BinaryMissing { .. } => (FailureKind::Configuration, error.to_string()),
        _ => (FailureKind::Exit, error.to_string()),
    }
}
