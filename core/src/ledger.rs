/// Subtask ledger: the durable record of execute-stage sub-steps.
///
/// One JSON document per task, stored as `subtasks.json` under the task's
/// docs directory. The external agent mutates subtask statuses while it
/// works; the engine only reads the ledger to decide whether the iterative
/// execute loop should run again. A missing ledger means the task has no
/// structured subtasks and counts as complete.
use crate::errors::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// File name of the ledger document inside a task's docs directory.
pub const LEDGER_FILE: &str = "subtasks.json";

/// Status of a single subtask.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl SubtaskStatus {
    /// `completed` and `skipped` both count toward completion. Skipped items
    /// are typically manual-verification steps the agent cannot automate;
    /// leaving them out of the numerator would make 100% unreachable.
    pub fn is_done(&self) -> bool {
        matches!(self, SubtaskStatus::Completed | SubtaskStatus::Skipped)
    }
}

/// A single sub-step of a task's execute stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub content: String,
    pub status: SubtaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            status: SubtaskStatus::Pending,
            completed_at: None,
        }
    }
}

/// The per-task ledger document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskLedger {
    pub task_id: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl SubtaskLedger {
    pub fn new(task_id: i64) -> Self {
        Self {
            task_id,
            updated_at: Utc::now(),
            subtasks: Vec::new(),
        }
    }

    /// True iff every subtask is completed or skipped. An empty ledger is
    /// vacuously complete.
    pub fn is_all_complete(&self) -> bool {
        self.subtasks.iter().all(|s| s.status.is_done())
    }

    /// Subtasks the agent still has to act on, in ledger order.
    pub fn remaining(&self) -> Vec<&Subtask> {
        self.subtasks.iter().filter(|s| !s.status.is_done()).collect()
    }

    /// Aggregate completion counts for reporting.
    pub fn completion_stats(&self) -> CompletionStats {
        let mut stats = CompletionStats {
            total: self.subtasks.len(),
            ..Default::default()
        };
        for subtask in &self.subtasks {
            match subtask.status {
                SubtaskStatus::Pending => stats.pending += 1,
                SubtaskStatus::InProgress => stats.in_progress += 1,
                SubtaskStatus::Completed => stats.completed += 1,
                SubtaskStatus::Skipped => stats.skipped += 1,
            }
        }
        stats.percent = if stats.total == 0 {
            100.0
        } else {
            (stats.completed + stats.skipped) as f64 / stats.total as f64 * 100.0
        };
        stats
    }

    /// Set a subtask's status. `completed_at` is set iff the new status is
    /// `completed` and cleared otherwise.
    pub fn update_status(&mut self, subtask_id: &str, status: SubtaskStatus) -> LedgerResult<()> {
        let subtask = self
            .subtasks
            .iter_mut()
            .find(|s| s.id == subtask_id)
            .ok_or_else(|| LedgerError::SubtaskNotFound(subtask_id.to_string()))?;
        subtask.status = status;
        subtask.completed_at = if status == SubtaskStatus::Completed {
            Some(Utc::now())
        } else {
            None
        };
        Ok(())
    }
}

/// Completion counts where both `completed` and `skipped` count as done.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionStats {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub percent: f64,
}

/// File-backed access to per-task subtask ledgers.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    /// Workspace root; docs paths resolve against it.
    workspace_path: PathBuf,
}

impl LedgerStore {
    pub fn new<P: AsRef<Path>>(workspace_path: P) -> Self {
        Self {
            workspace_path: workspace_path.as_ref().to_path_buf(),
        }
    }

    fn ledger_path(&self, docs_path: &str) -> PathBuf {
        self.workspace_path.join(docs_path).join(LEDGER_FILE)
    }

    /// Load the ledger for a docs path. Returns `Ok(None)` when no ledger
    /// file exists; a file that exists but fails to parse is an error the
    /// caller decides how to degrade.
    pub async fn load(&self, docs_path: &str) -> LedgerResult<Option<SubtaskLedger>> {
        let path = self.ledger_path(docs_path);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let ledger: SubtaskLedger = serde_json::from_str(&content)?;
        Ok(Some(ledger))
    }

    /// Write the ledger, refreshing `updated_at`. Writes to a temp file then
    /// renames so a crash mid-write never leaves a torn document.
    pub async fn save(&self, docs_path: &str, ledger: &mut SubtaskLedger) -> LedgerResult<()> {
        ledger.updated_at = Utc::now();
        let path = self.ledger_path(docs_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(ledger)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Operator override: set one subtask's status and persist.
    pub async fn update_status(
        &self,
        docs_path: &str,
        subtask_id: &str,
        status: SubtaskStatus,
    ) -> LedgerResult<SubtaskLedger> {
        let mut ledger = self
            .load(docs_path)
            .await?
            .ok_or_else(|| LedgerError::LedgerNotFound(docs_path.to_string()))?;
        ledger.update_status(subtask_id, status)?;
        self.save(docs_path, &mut ledger).await?;
        Ok(ledger)
    }

    /// Completion stats for a task, if it has a ledger.
    pub async fn completion_stats(&self, docs_path: &str) -> LedgerResult<Option<CompletionStats>> {
        Ok(self.load(docs_path).await?.map(|l| l.completion_stats()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(statuses: &[SubtaskStatus]) -> SubtaskLedger {
        let mut ledger = SubtaskLedger::new(1);
        for (i, status) in statuses.iter().enumerate() {
            let mut subtask = Subtask::new(format!("step {}", i));
            subtask.status = *status;
            ledger.subtasks.push(subtask);
        }
        ledger
    }

    #[test]
    fn test_empty_ledger_is_complete() {
        let ledger = SubtaskLedger::new(1);
        assert!(ledger.is_all_complete());
        assert_eq!(ledger.completion_stats().percent, 100.0);
    }

    #[test]
    fn test_skipped_counts_as_done() {
        let ledger = ledger_with(&[
            SubtaskStatus::Completed,
            SubtaskStatus::Skipped,
            SubtaskStatus::Completed,
        ]);
        assert!(ledger.is_all_complete());
        let stats = ledger.completion_stats();
        assert_eq!(stats.percent, 100.0);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_pending_blocks_completion() {
        let ledger = ledger_with(&[SubtaskStatus::Completed, SubtaskStatus::Pending]);
        assert!(!ledger.is_all_complete());
        let stats = ledger.completion_stats();
        assert_eq!(stats.percent, 50.0);
        assert_eq!(ledger.remaining().len(), 1);
    }

    #[test]
    fn test_update_status_sets_and_clears_completed_at() {
        let mut ledger = ledger_with(&[SubtaskStatus::Pending]);
        let id = ledger.subtasks[0].id.clone();

        ledger.update_status(&id, SubtaskStatus::Completed).unwrap();
        assert!(ledger.subtasks[0].completed_at.is_some());

        ledger.update_status(&id, SubtaskStatus::InProgress).unwrap();
        assert!(ledger.subtasks[0].completed_at.is_none());

        let err = ledger
            .update_status("no-such-id", SubtaskStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, LedgerError::SubtaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        assert!(store.load("tasks/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());

        let mut ledger = ledger_with(&[SubtaskStatus::Pending, SubtaskStatus::Pending]);
        store.save("tasks/1", &mut ledger).await.unwrap();

        let loaded = store.load("tasks/1").await.unwrap().unwrap();
        assert_eq!(loaded.subtasks.len(), 2);
        assert!(!loaded.is_all_complete());
    }

    #[tokio::test]
    async fn test_update_status_without_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        let err = store
            .update_status("tasks/9", "some-id", SubtaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LedgerNotFound(_)));
    }

    #[tokio::test]
    async fn test_malformed_ledger_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("tasks/1");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join(LEDGER_FILE), "{not json").unwrap();

        let store = LedgerStore::new(dir.path());
        let err = store.load("tasks/1").await.unwrap_err();
        assert!(matches!(err, LedgerError::Malformed(_)));
    }
}
