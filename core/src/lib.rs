//! Formic core: a task workflow and queue execution engine.
//!
//! Tasks move through a three-stage workflow (brief, plan, execute), each
//! stage one or more invocations of an external agent CLI. The execute stage
//! iterates against a per-task subtask ledger until every subtask is done or
//! the iteration budget runs out. A queue scheduler dispatches queued tasks
//! under a global concurrency ceiling, and startup recovery resets work that
//! was interrupted by a crash.

pub mod config;
pub mod errors;
pub mod events;
pub mod invoker;
pub mod ledger;
pub mod prompts;
pub mod scheduler;
pub mod sequencer;
pub mod store;
pub mod task;

pub use config::EngineConfig;
pub use errors::{EngineError, EngineResult, InvokerError, LedgerError, StoreError};
pub use events::{EventBus, StreamEventKind, TaskStreamEvent};
pub use invoker::{AgentInvoker, CliAgentInvoker, Invocation, InvocationOutcome, InvocationRequest};
pub use ledger::{CompletionStats, LedgerStore, Subtask, SubtaskLedger, SubtaskStatus};
pub use prompts::{build_step_prompt, FileTemplateProvider, TemplateProvider};
pub use scheduler::QueueScheduler;
pub use sequencer::{ActiveRunInfo, FailureKind, StepOutcome, WorkflowSequencer};
pub use store::{SqliteTaskStore, TaskUpdate};
pub use task::{Task, TaskPriority, TaskStatus, WorkflowLogs, WorkflowStep};
