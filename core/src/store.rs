/// SQLite-backed task store.
///
/// Durable record of tasks and their status/workflow metadata, plus the
/// startup recovery procedure. Assumed immediately consistent for a single
/// process; there is no cross-process locking.
use crate::errors::{StoreError, StoreResult};
use crate::task::{
    append_log_lines, Task, TaskPriority, TaskStatus, WorkflowLogs, WorkflowStep,
};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    pool: SqlitePool,
    _db_path: PathBuf,
}

/// Fields a client may edit on an existing task. `None` leaves the field
/// unchanged. `docs_path` is deliberately absent: immutable once created.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub context: Option<Option<String>>,
    pub priority: Option<TaskPriority>,
}

impl SqliteTaskStore {
    /// Open (creating if missing) the task database at `db_path`.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::DatabaseError(format!("Failed to create directory: {}", e))
                })?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())
            .map_err(|e| {
                StoreError::DatabaseError(format!("Failed to parse database path: {}", e))
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                StoreError::DatabaseError(format!("Failed to create database pool: {}", e))
            })?;

        let store = SqliteTaskStore {
            pool,
            _db_path: db_path,
        };
        store.apply_migrations().await?;
        Ok(store)
    }

    /// Apply all pending schema migrations.
    async fn apply_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                applied_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StoreError::MigrationError(format!("Failed to create migrations table: {}", e))
        })?;

        let max_version: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::MigrationError(format!("Failed to query migration version: {}", e))
                })?;

        let migrations: Vec<(i32, &str, Vec<&str>)> = vec![(
            1,
            "create_tasks",
            vec![
                r#"CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    context TEXT,
                    status TEXT NOT NULL DEFAULT 'todo',
                    workflow_step TEXT NOT NULL DEFAULT 'pending',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    docs_path TEXT NOT NULL DEFAULT '',
                    queued_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    workflow_logs TEXT NOT NULL DEFAULT '{}'
                )"#,
                r#"CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)"#,
                r#"CREATE INDEX IF NOT EXISTS idx_tasks_status_queued ON tasks(status, queued_at)"#,
            ],
        )];

        for (version, name, statements) in migrations {
            if version > max_version {
                for statement in statements {
                    sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                        StoreError::MigrationError(format!(
                            "Failed to apply migration {}: {}",
                            name, e
                        ))
                    })?;
                }

                sqlx::query("INSERT INTO migrations (version, name, applied_at) VALUES (?, ?, ?)")
                    .bind(version)
                    .bind(name)
                    .bind(Utc::now().timestamp())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        StoreError::MigrationError(format!(
                            "Failed to record migration {}: {}",
                            name, e
                        ))
                    })?;
            }
        }

        Ok(())
    }

    /// Create a new task in `todo` with a fresh docs path (`tasks/{id}`).
    pub async fn create_task(
        &self,
        title: &str,
        context: Option<&str>,
        priority: TaskPriority,
    ) -> StoreResult<Task> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (title, context, status, workflow_step, priority, created_at, updated_at)
            VALUES (?, ?, 'todo', 'pending', ?, ?, ?)
            "#,
        )
        .bind(title)
        .bind(context)
        .bind(priority.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to insert task: {}", e)))?;

        let id = result.last_insert_rowid();
        let docs_path = format!("tasks/{}", id);
        sqlx::query("UPDATE tasks SET docs_path = ? WHERE id = ?")
            .bind(&docs_path)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to set docs path: {}", e)))?;

        self.get_task(id).await?.ok_or(StoreError::TaskNotFound(id))
    }

    /// Get a task by id.
    pub async fn get_task(&self, id: i64) -> StoreResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch task: {}", e)))?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    /// Persist a full task record (status, step, priority, logs, timestamps).
    pub async fn save_task(&self, task: &Task) -> StoreResult<()> {
        let logs = serde_json::to_string(&task.workflow_logs)?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET title = ?, context = ?, status = ?, workflow_step = ?, priority = ?,
                queued_at = ?, updated_at = ?, workflow_logs = ?
            WHERE id = ?
            "#,
        )
        .bind(&task.title)
        .bind(&task.context)
        .bind(task.status.to_string())
        .bind(task.workflow_step.to_string())
        .bind(task.priority.to_string())
        .bind(task.queued_at.map(|t| t.timestamp()))
        .bind(Utc::now().timestamp())
        .bind(&logs)
        .bind(task.id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to save task: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task.id));
        }
        Ok(())
    }

    /// Apply client edits (title/context/priority) to an existing task.
    pub async fn update_task(&self, id: i64, update: TaskUpdate) -> StoreResult<Task> {
        let mut task = self.get_task(id).await?.ok_or(StoreError::TaskNotFound(id))?;
        if let Some(title) = update.title {
            task.title = title;
        }
        if let Some(context) = update.context {
            task.context = context;
        }
        if let Some(priority) = update.priority {
            task.priority = priority;
        }
        self.save_task(&task).await?;
        self.get_task(id).await?.ok_or(StoreError::TaskNotFound(id))
    }

    /// Delete a task. Callers must stop any attached workflow run first.
    pub async fn delete_task(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to delete task: {}", e)))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    /// All tasks, oldest first. The board feed.
    pub async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to list tasks: {}", e)))?;
        rows.iter().map(row_to_task).collect()
    }

    /// Tasks in a given status.
    pub async fn list_by_status(&self, status: TaskStatus) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY id ASC")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to list tasks: {}", e)))?;
        rows.iter().map(row_to_task).collect()
    }

    /// Number of tasks currently held by a workflow (briefing/planning/running).
    pub async fn count_active(&self) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE status IN ('briefing', 'planning', 'running')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to count active tasks: {}", e)))?;
        Ok(count as usize)
    }

    /// Set a task's status. Entering `queued` stamps `queued_at`; leaving the
    /// queue for `todo` clears it so a re-queue gets a fresh position.
    pub async fn set_status(&self, id: i64, status: TaskStatus) -> StoreResult<()> {
        let now = Utc::now().timestamp();
        let result = match status {
            TaskStatus::Queued => {
                sqlx::query("UPDATE tasks SET status = ?, queued_at = ?, updated_at = ? WHERE id = ?")
                    .bind(status.to_string())
                    .bind(now)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
            }
            TaskStatus::Todo => {
                sqlx::query(
                    "UPDATE tasks SET status = ?, queued_at = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(status.to_string())
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
            }
            _ => {
                sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
                    .bind(status.to_string())
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::DatabaseError(format!("Failed to set status: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    /// Record which workflow stage last completed.
    pub async fn set_workflow_step(&self, id: i64, step: WorkflowStep) -> StoreResult<()> {
        let result = sqlx::query("UPDATE tasks SET workflow_step = ?, updated_at = ? WHERE id = ?")
            .bind(step.to_string())
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to set workflow step: {}", e)))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    /// Append lines to a task's per-step log, keeping the bounded tail.
    pub async fn append_log(&self, id: i64, step: WorkflowStep, lines: &[String]) -> StoreResult<()> {
        let mut task = self.get_task(id).await?.ok_or(StoreError::TaskNotFound(id))?;
        append_log_lines(&mut task.workflow_logs, step, lines);
        self.save_task(&task).await
    }

    /// Startup recovery: reset every task an unclean shutdown left in an
    /// active or queued state back to `todo`. `workflow_step` is deliberately
    /// untouched so a resumed task keeps its progress history. Returns the
    /// number of tasks recovered; idempotent.
    pub async fn recover_interrupted(&self) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'todo', queued_at = NULL, updated_at = ?
            WHERE status IN ('briefing', 'planning', 'running', 'queued')
            "#,
        )
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to recover tasks: {}", e)))?;
        Ok(result.rows_affected() as usize)
    }
}

fn parse_timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn row_to_task(row: &SqliteRow) -> StoreResult<Task> {
    let status: String = row.get("status");
    let step: String = row.get("workflow_step");
    let priority: String = row.get("priority");
    let logs: String = row.get("workflow_logs");

    let workflow_logs: WorkflowLogs = serde_json::from_str(&logs).unwrap_or_default();

    Ok(Task {
        id: row.get("id"),
        title: row.get("title"),
        context: row.get("context"),
        status: status
            .parse()
            .map_err(|e: String| StoreError::DatabaseError(e))?,
        workflow_step: step
            .parse()
            .map_err(|e: String| StoreError::DatabaseError(e))?,
        priority: priority
            .parse()
            .map_err(|e: String| StoreError::DatabaseError(e))?,
        docs_path: row.get("docs_path"),
        queued_at: row.get::<Option<i64>, _>("queued_at").map(parse_timestamp),
        created_at: parse_timestamp(row.get("created_at")),
        updated_at: parse_timestamp(row.get("updated_at")),
        workflow_logs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, SqliteTaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::new(dir.path().join("formic.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_dir, store) = open_store().await;
        let task = store
            .create_task("Ship it", Some("some context"), TaskPriority::High)
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.workflow_step, WorkflowStep::Pending);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.docs_path, format!("tasks/{}", task.id));
        assert!(task.queued_at.is_none());

        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Ship it");
        assert_eq!(fetched.context.as_deref(), Some("some context"));
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let (_dir, store) = open_store().await;
        let a = store.create_task("a", None, TaskPriority::Medium).await.unwrap();
        let b = store.create_task("b", None, TaskPriority::Medium).await.unwrap();
        store.delete_task(b.id).await.unwrap();
        let c = store.create_task("c", None, TaskPriority::Medium).await.unwrap();
        assert!(b.id > a.id);
        assert!(c.id > b.id);
    }

    #[tokio::test]
    async fn test_queued_at_stamped_and_cleared() {
        let (_dir, store) = open_store().await;
        let task = store.create_task("t", None, TaskPriority::Medium).await.unwrap();

        store.set_status(task.id, TaskStatus::Queued).await.unwrap();
        let queued = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
        assert!(queued.queued_at.is_some());

        store.set_status(task.id, TaskStatus::Todo).await.unwrap();
        let back = store.get_task(task.id).await.unwrap().unwrap();
        assert!(back.queued_at.is_none());
    }

    #[tokio::test]
    async fn test_update_task_edits() {
        let (_dir, store) = open_store().await;
        let task = store.create_task("t", None, TaskPriority::Low).await.unwrap();

        let updated = store
            .update_task(
                task.id,
                TaskUpdate {
                    priority: Some(TaskPriority::High),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, TaskPriority::High);
        assert_eq!(updated.title, "t");
        assert_eq!(updated.docs_path, task.docs_path);
    }

    #[tokio::test]
    async fn test_append_log_caps_tail() {
        let (_dir, store) = open_store().await;
        let task = store.create_task("t", None, TaskPriority::Medium).await.unwrap();

        let lines: Vec<String> = (0..70).map(|i| format!("line {}", i)).collect();
        store.append_log(task.id, WorkflowStep::Brief, &lines).await.unwrap();

        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        let brief = &fetched.workflow_logs["brief"];
        assert_eq!(brief.len(), crate::task::LOG_TAIL_LINES);
        assert_eq!(brief.last().unwrap(), "line 69");
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let (_dir, store) = open_store().await;
        let running = store.create_task("r", None, TaskPriority::Medium).await.unwrap();
        let queued = store.create_task("q", None, TaskPriority::Medium).await.unwrap();
        let review = store.create_task("v", None, TaskPriority::Medium).await.unwrap();

        store.set_status(running.id, TaskStatus::Running).await.unwrap();
        store.set_workflow_step(running.id, WorkflowStep::Plan).await.unwrap();
        store.set_status(queued.id, TaskStatus::Queued).await.unwrap();
        store.set_status(review.id, TaskStatus::Review).await.unwrap();

        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered, 2);

        let r = store.get_task(running.id).await.unwrap().unwrap();
        assert_eq!(r.status, TaskStatus::Todo);
        // Progress history survives recovery.
        assert_eq!(r.workflow_step, WorkflowStep::Plan);

        let v = store.get_task(review.id).await.unwrap().unwrap();
        assert_eq!(v.status, TaskStatus::Review);

        // Idempotent: a second pass recovers nothing.
        assert_eq!(store.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_count_active() {
        let (_dir, store) = open_store().await;
        let a = store.create_task("a", None, TaskPriority::Medium).await.unwrap();
        let b = store.create_task("b", None, TaskPriority::Medium).await.unwrap();
        assert_eq!(store.count_active().await.unwrap(), 0);

        store.set_status(a.id, TaskStatus::Briefing).await.unwrap();
        store.set_status(b.id, TaskStatus::Running).await.unwrap();
        assert_eq!(store.count_active().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_missing_task() {
        let (_dir, store) = open_store().await;
        assert!(matches!(
            store.delete_task(999).await.unwrap_err(),
            StoreError::TaskNotFound(999)
        ));
    }
}
