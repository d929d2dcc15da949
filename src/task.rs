//! Task and TaskResult: the two shapes threaded through the whole dispatch
//! plane (spec §3). A Task exists only for the duration of one subprocess
//! invocation; a TaskResult is immutable once written.

use crate::trust::PermissionMutable;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub model: String,
    pub provider: Option<String>,
    pub timeout: Duration,
    pub budget_usd: Option<f64>,
    pub permission_mode: String,
    pub extra_dirs: Vec<PathBuf>,
    /// Free-text source tag: `cron|dispatch|telegram|route:…|taskboard|ask|workflow`.
    pub source: String,
    pub system_prompt: Option<String>,
    /// Internal session row id (spec C4), not the provider's own conversation token.
    pub session_id: Option<i64>,
    pub mcp_bundle: Option<String>,
    pub agent: String,
    /// `{{last_output}}`/`{{last_prompt}}`/`{{last_time}}` are keyed by this.
    pub job_id: Option<String>,
}

impl PermissionMutable for Task {
    fn force_plan_mode(&mut self) {
        self.permission_mode = "plan".to_string();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Success)
    }
}

/// Terminal record of a Task. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model_used: String,
    pub duration_ms: u64,
    pub session_id: Option<i64>,
    pub output_file: Option<String>,
}
