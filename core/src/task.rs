/// Task model for the Formic workflow engine.
///
/// A task is the unit of user-requested work. Its `status` is the single
/// source of truth for where it sits on the board; `workflow_step` records
/// which workflow stage last completed and survives crash recovery so a
/// resumed task keeps its history.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum log lines retained per workflow step.
pub const LOG_TAIL_LINES: usize = 50;

/// Status of a task on the board.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Queued,
    Briefing,
    Planning,
    Running,
    Review,
    Done,
}

impl TaskStatus {
    /// Statuses that mean a workflow is (or was) actively holding this task.
    /// These are the ones the recovery procedure resets and the scheduler
    /// counts against the concurrency ceiling (plus `queued` for recovery).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Briefing | TaskStatus::Planning | TaskStatus::Running
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "todo"),
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Briefing => write!(f, "briefing"),
            TaskStatus::Planning => write!(f, "planning"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Review => write!(f, "review"),
            TaskStatus::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "queued" => Ok(TaskStatus::Queued),
            "briefing" => Ok(TaskStatus::Briefing),
            "planning" => Ok(TaskStatus::Planning),
            "running" => Ok(TaskStatus::Running),
            "review" => Ok(TaskStatus::Review),
            "done" => Ok(TaskStatus::Done),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// The workflow stage that last completed for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Pending,
    Brief,
    Plan,
    Execute,
    Complete,
}

impl WorkflowStep {
    /// The stage recorded once this step finishes successfully.
    pub fn next(&self) -> WorkflowStep {
        match self {
            WorkflowStep::Pending => WorkflowStep::Brief,
            WorkflowStep::Brief => WorkflowStep::Plan,
            WorkflowStep::Plan => WorkflowStep::Execute,
            WorkflowStep::Execute => WorkflowStep::Complete,
            WorkflowStep::Complete => WorkflowStep::Complete,
        }
    }

    /// The board status a task shows while this step is running.
    pub fn running_status(&self) -> TaskStatus {
        match self {
            WorkflowStep::Brief => TaskStatus::Briefing,
            WorkflowStep::Plan => TaskStatus::Planning,
            _ => TaskStatus::Running,
        }
    }
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStep::Pending => write!(f, "pending"),
            WorkflowStep::Brief => write!(f, "brief"),
            WorkflowStep::Plan => write!(f, "plan"),
            WorkflowStep::Execute => write!(f, "execute"),
            WorkflowStep::Complete => write!(f, "complete"),
        }
    }
}

impl std::str::FromStr for WorkflowStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStep::Pending),
            "brief" => Ok(WorkflowStep::Brief),
            "plan" => Ok(WorkflowStep::Plan),
            "execute" => Ok(WorkflowStep::Execute),
            "complete" => Ok(WorkflowStep::Complete),
            _ => Err(format!("Invalid workflow step: {}", s)),
        }
    }
}

/// Priority level of a task. Ordering key for the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    /// Lower rank is scheduled first.
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Medium => 1,
            TaskPriority::Low => 2,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(TaskPriority::High),
            "medium" => Ok(TaskPriority::Medium),
            "low" => Ok(TaskPriority::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Per-step workflow logs: step name -> last [`LOG_TAIL_LINES`] lines.
/// Observability only; never consulted for control decisions.
pub type WorkflowLogs = HashMap<String, Vec<String>>;

/// A task tracked through the workflow state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable id, monotonically increasing per workspace.
    pub id: i64,
    pub title: String,
    /// Free-form user context handed to the agent with every step prompt.
    pub context: Option<String>,
    pub status: TaskStatus,
    pub workflow_step: WorkflowStep,
    pub priority: TaskPriority,
    /// Documentation/output location relative to the workspace root.
    /// Immutable once created.
    pub docs_path: String,
    pub queued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub workflow_logs: WorkflowLogs,
}

impl Task {
    /// The FIFO tie-break key: `queued_at`, falling back to `created_at`.
    pub fn queue_time(&self) -> DateTime<Utc> {
        self.queued_at.unwrap_or(self.created_at)
    }
}

/// Sort queued tasks into dispatch order: priority first (high > medium >
/// low), then earliest queue time. Recomputed from scratch on every
/// scheduler tick, so priority edits take effect on the next tick.
pub fn sort_queue(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.priority
            .rank()
            .cmp(&b.priority.rank())
            .then(a.queue_time().cmp(&b.queue_time()))
    });
}

/// Append lines to a step's log, keeping only the last [`LOG_TAIL_LINES`].
pub fn append_log_lines(logs: &mut WorkflowLogs, step: WorkflowStep, lines: &[String]) {
    let entry = logs.entry(step.to_string()).or_default();
    entry.extend(lines.iter().cloned());
    if entry.len() > LOG_TAIL_LINES {
        let drop = entry.len() - LOG_TAIL_LINES;
        entry.drain(..drop);
    }
}
