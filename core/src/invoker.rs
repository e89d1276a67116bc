/// Agent process invocation.
///
/// Spawns one external agent CLI process per step invocation, streams its
/// output to the event bus, and enforces the per-invocation timeout with a
/// graceful-then-forced kill. The engine never interprets the output; only
/// the exit code, timeout, and spawn errors feed back into control flow.
use crate::config::EngineConfig;
use crate::errors::{InvokerError, InvokerResult};
use crate::events::{EventBus, StreamEventKind, TaskStreamEvent};
use crate::task::{WorkflowStep, LOG_TAIL_LINES};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One step invocation of the agent.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub task_id: i64,
    pub step: WorkflowStep,
    pub prompt: String,
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Exited { code: Option<i32>, success: bool },
    TimedOut,
    Cancelled,
}

/// Result of one invocation: the outcome plus the last lines of combined
/// output, for the task's bounded step log.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub outcome: InvocationOutcome,
    pub tail: Vec<String>,
}

/// Spawns one agent process per step invocation.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> InvokerResult<Invocation>;
}

/// Invoker backed by a local CLI process (e.g. `claude`).
pub struct CliAgentInvoker {
    command: String,
    args: Vec<String>,
    env: std::collections::HashMap<String, String>,
    working_dir: PathBuf,
    step_timeout: Duration,
    kill_grace: Duration,
    events: Arc<EventBus>,
}

impl CliAgentInvoker {
    pub fn new(config: &EngineConfig, events: Arc<EventBus>) -> Self {
        Self {
            command: config.agent_command.clone(),
            args: config.agent_args.clone(),
            env: config.agent_env.clone(),
            working_dir: config.workspace_path.clone(),
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            events,
        }
    }

    fn build_command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg(prompt);
        cmd.current_dir(&self.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Graceful termination: SIGTERM, wait out the grace window, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!("SIGTERM failed for pid {}: {}", pid, e);
                }
                match tokio::time::timeout(self.kill_grace, child.wait()).await {
                    Ok(_) => return,
                    Err(_) => {
                        warn!("Agent process {} ignored SIGTERM, force killing", pid);
                    }
                }
            }
        }
        if let Err(e) = child.kill().await {
            warn!("Failed to kill agent process: {}", e);
        }
    }
}

#[async_trait]
impl AgentInvoker for CliAgentInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> InvokerResult<Invocation> {
        let mut cmd = self.build_command(&request.prompt);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InvokerError::BinaryMissing {
                    command: self.command.clone(),
                }
            } else {
                InvokerError::SpawnFailed(format!(
                    "Failed to spawn '{}': {}",
                    self.command, e
                ))
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InvokerError::SpawnFailed("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| InvokerError::SpawnFailed("Failed to capture stderr".to_string()))?;

        // Stream both pipes to the event bus while collecting a bounded tail.
        let stdout_task = {
            let events = Arc::clone(&self.events);
            let task_id = request.task_id;
            let step = request.step;
            tokio::spawn(async move {
                let mut lines = Vec::new();
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    events.publish(TaskStreamEvent::new(
                        task_id,
                        step,
                        StreamEventKind::Stdout,
                        line.clone(),
                    ));
                    lines.push(line);
                }
                lines
            })
        };
        let stderr_task = {
            let events = Arc::clone(&self.events);
            let task_id = request.task_id;
            let step = request.step;
            tokio::spawn(async move {
                let mut lines = Vec::new();
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    events.publish(TaskStreamEvent::new(
                        task_id,
                        step,
                        StreamEventKind::Stderr,
                        line.clone(),
                    ));
                    lines.push(format!("[stderr] {}", line));
                }
                lines
            })
        };

        let outcome = tokio::select! {
            status = child.wait() => {
                let status = status?;
                debug!(task_id = request.task_id, step = %request.step,
                       "Agent exited with code {:?}", status.code());
                InvocationOutcome::Exited {
                    code: status.code(),
                    success: status.success(),
                }
            }
            _ = tokio::time::sleep(self.step_timeout) => {
                warn!(task_id = request.task_id, step = %request.step,
                      "Agent invocation timed out after {:?}", self.step_timeout);
                self.terminate(&mut child).await;
                InvocationOutcome::TimedOut
            }
            _ = cancel.cancelled() => {
                debug!(task_id = request.task_id, step = %request.step,
                       "Agent invocation cancelled");
                self.terminate(&mut child).await;
                InvocationOutcome::Cancelled
            }
        };

        let stdout_lines = stdout_task.await.unwrap_or_default();
        let stderr_lines = stderr_task.await.unwrap_or_default();

        let mut tail: Vec<String> = stdout_lines;
        tail.extend(stderr_lines);
        if tail.len() > LOG_TAIL_LINES {
            let drop = tail.len() - LOG_TAIL_LINES;
            tail.drain(..drop);
        }

        Ok(Invocation { outcome, tail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn shell_invoker(dir: &std::path::Path, timeout_secs: u64) -> CliAgentInvoker {
        let config = EngineConfig {
            workspace_path: dir.to_path_buf(),
            agent_command: "sh".to_string(),
            agent_args: vec!["-c".to_string()],
            step_timeout_secs: timeout_secs,
            kill_grace_secs: 1,
            ..Default::default()
        };
        CliAgentInvoker::new(&config, Arc::new(EventBus::new()))
    }

    fn request(prompt: &str) -> InvocationRequest {
        InvocationRequest {
            task_id: 1,
            step: WorkflowStep::Brief,
            prompt: prompt.to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_exit_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = shell_invoker(dir.path(), 30);

        let invocation = invoker
            .invoke(request("echo one; echo two"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            invocation.outcome,
            InvocationOutcome::Exited { code: Some(0), success: true }
        );
        assert_eq!(invocation.tail, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = shell_invoker(dir.path(), 30);

        let invocation = invoker
            .invoke(request("echo oops >&2; exit 3"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            invocation.outcome,
            InvocationOutcome::Exited { code: Some(3), success: false }
        );
        assert_eq!(invocation.tail, vec!["[stderr] oops"]);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = shell_invoker(dir.path(), 1);

        let start = std::time::Instant::now();
        let invocation = invoker
            .invoke(request("sleep 30"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(invocation.outcome, InvocationOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = shell_invoker(dir.path(), 60);

        let cancel = CancellationToken::new();
        let handle = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel();
        });

        let invocation = invoker.invoke(request("sleep 30"), cancel).await.unwrap();
        assert_eq!(invocation.outcome, InvocationOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            workspace_path: dir.path().to_path_buf(),
            agent_command: "formic-test-no-such-binary".to_string(),
            ..Default::default()
        };
        let invoker = CliAgentInvoker::new(&config, Arc::new(EventBus::new()));

        let err = invoker
            .invoke(request("hello"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokerError::BinaryMissing { .. }));
    }
}
