/// Event bus for streaming task output to observers.
///
/// The engine emits one event per process output chunk and on step
/// completion. Transports (WebSocket, chat adapters) subscribe here; the
/// engine itself never reads these events back for control decisions.
use crate::task::WorkflowStep;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Maximum number of events to buffer in the broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Kind of a task stream event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    /// A line the agent wrote to stdout.
    Stdout,
    /// A line the agent wrote to stderr.
    Stderr,
    /// A step invocation finished (data carries the exit description).
    Exit,
    /// A step failed, timed out, or ended incomplete.
    Error,
}

/// A single observability event for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStreamEvent {
    pub id: String,
    pub task_id: i64,
    pub step: WorkflowStep,
    pub kind: StreamEventKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskStreamEvent {
    pub fn new(task_id: i64, step: WorkflowStep, kind: StreamEventKind, data: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            step,
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast bus for [`TaskStreamEvent`]s.
pub struct EventBus {
    tx: broadcast::Sender<TaskStreamEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers. Send errors (no subscribers) are
    /// ignored; observability must never fail the engine.
    pub fn publish(&self, event: TaskStreamEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskStreamEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
