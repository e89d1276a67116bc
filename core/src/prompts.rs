/// Step prompt construction.
///
/// Instruction templates may be provided by the user as files under the
/// workspace; when absent, built-in minimal templates are used so the engine
/// never blocks on a missing template.
use crate::ledger::Subtask;
use crate::task::{Task, WorkflowStep};
use std::path::{Path, PathBuf};

/// Provides the instruction text for a workflow step. `None` means "no
/// user-provided template"; the sequencer then falls back to the built-in.
pub trait TemplateProvider: Send + Sync {
    fn template_for(&self, step: WorkflowStep) -> Option<String>;
}

/// Reads user templates from `prompts/{brief,plan,execute}.md` under the
/// workspace root. Any read failure is treated as "no template".
pub struct FileTemplateProvider {
    workspace_path: PathBuf,
}

impl FileTemplateProvider {
    pub fn new<P: AsRef<Path>>(workspace_path: P) -> Self {
        Self {
            workspace_path: workspace_path.as_ref().to_path_buf(),
        }
    }
}

impl TemplateProvider for FileTemplateProvider {
    fn template_for(&self, step: WorkflowStep) -> Option<String> {
        let path = self.workspace_path.join("prompts").join(format!("{}.md", step));
        std::fs::read_to_string(path).ok()
    }
}

/// Built-in fallback instruction for a step.
pub fn builtin_template(step: WorkflowStep) -> &'static str {
    match step {
        WorkflowStep::Brief => {
            "You are briefing the task \"{{title}}\".\n\
             Task context: {{context}}\n\n\
             Research the codebase and write a short specification of what this task\n\
             requires to {{docs_path}}/brief.md. Do not implement anything yet."
        }
        WorkflowStep::Plan => {
            "You are planning the task \"{{title}}\".\n\
             Task context: {{context}}\n\n\
             Read {{docs_path}}/brief.md, then write an implementation plan to\n\
             {{docs_path}}/plan.md and break it into concrete subtasks in\n\
             {{docs_path}}/subtasks.json. Each subtask needs an id, a content\n\
             description, and status \"pending\". Do not implement anything yet."
        }
        _ => {
            "You are implementing the task \"{{title}}\".\n\
             Task context: {{context}}\n\n\
             Follow the plan in {{docs_path}}/plan.md. Work through the subtasks in\n\
             {{docs_path}}/subtasks.json, and after finishing each one update its\n\
             status to \"completed\" (or \"skipped\" if it requires manual action you\n\
             cannot automate) in that file."
        }
    }
}

/// Build the full prompt for one step invocation.
///
/// `template` is the user-provided instruction if any; `remaining` lists the
/// unfinished subtasks and is non-empty only for execute iterations after the
/// first, so the agent gets targeted, shrinking feedback instead of
/// re-reading the full plan.
pub fn build_step_prompt(
    step: WorkflowStep,
    task: &Task,
    template: Option<String>,
    remaining: &[&Subtask],
) -> String {
    let template = template.unwrap_or_else(|| builtin_template(step).to_string());
    let mut prompt = template
        .replace("{{title}}", &task.title)
        .replace("{{context}}", task.context.as_deref().unwrap_or("None"))
        .replace("{{docs_path}}", &task.docs_path);

    if !remaining.is_empty() {
        prompt.push_str("\n\n---\nUNFINISHED SUBTASKS:\n");
        for subtask in remaining {
            prompt.push_str(&format!(
                "- [{}] {} (id: {})\n",
                match subtask.status {
                    crate::ledger::SubtaskStatus::InProgress => "in_progress",
                    _ => "pending",
                },
                subtask.content,
                subtask.id
            ));
        }
        prompt.push_str(
            "Finish only these subtasks, then update their status in the subtasks\n\
             file. Previous work persists in the working tree.\n---",
        );
    }

    prompt
}
