//! Task runner (C7): resolves a provider, expands template variables, spawns
//! the provider subprocess under the global concurrency semaphore, enforces
//! a timeout, parses the usage footer, and persists a TaskResult.

use crate::db::history::HistoryInsert;
use crate::db::{now_ms, Db};
use crate::task::{Task, TaskResult, TaskStatus};
use crate::template::{self, JobState, KnowledgeSearch};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const MAX_OUTPUT_BYTES: usize = 200_000;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("semaphore closed")]
    SemaphoreClosed,
    #[error("store error: {0}")]
    Store(#[from] crate::db::DbError),
}

/// Raw subprocess result, before usage-footer parsing.
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Abstraction over "spawn a provider subprocess and collect output" so the
/// runner's orchestration logic (semaphore, template expansion, usage
/// parsing, persistence) can be tested without spawning a real process.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn invoke(&self, task: &Task, cancel: &CancellationToken) -> Result<RawOutput, RunnerError>;
}

fn build_args(task: &Task) -> Vec<String> {
    let mut args = vec!["--model".to_string(), task.model.clone(), "--permission-mode".to_string(), task.permission_mode.clone()];
    for dir in &task.extra_dirs {
        args.push("--add-dir".to_string());
        args.push(dir.display().to_string());
    }
    if let Some(bundle) = &task.mcp_bundle {
        args.push("--mcp-config".to_string());
        args.push(bundle.clone());
    }
    if let Some(system_prompt) = &task.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(system_prompt.clone());
    }
    args.push("--print".to_string());
    args.push(task.prompt.clone());
    args
}

/// Spawns the real binary named by `task.provider` (or a configured
/// default), killing the child if it outruns `task.timeout`.
pub struct SubprocessProvider {
    pub default_binary: String,
}

#[async_trait]
impl Provider for SubprocessProvider {
    async fn invoke(&self, task: &Task, cancel: &CancellationToken) -> Result<RawOutput, RunnerError> {
        let binary = task.provider.as_deref().unwrap_or(&self.default_binary);
        let args = build_args(task);
        let mut child = Command::new(binary)
            .args(&args)
            .current_dir(&task.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout_pipe = child.stdout.take().expect("piped stdout");
        let mut stderr_pipe = child.stderr.take().expect("piped stderr");

        let read_fut = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut stdout).await;
            let _ = stderr_pipe.read_to_end(&mut stderr).await;
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        tokio::select! {
            result = tokio::time::timeout(task.timeout, read_fut) => match result {
                Ok((stdout, stderr, status)) => Ok(RawOutput {
                    stdout: truncate_bytes(&String::from_utf8_lossy(&stdout), MAX_OUTPUT_BYTES),
                    stderr: truncate_bytes(&String::from_utf8_lossy(&stderr), MAX_OUTPUT_BYTES),
                    exit_code: status.ok().and_then(|s| s.code()),
                    timed_out: false,
                    cancelled: false,
                }),
                Err(_) => {
                    let _ = child.start_kill();
                    Ok(RawOutput {
                        stdout: String::new(),
                        stderr: "timed out".to_string(),
                        exit_code: None,
                        timed_out: true,
                        cancelled: false,
                    })
                }
            },
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                Ok(RawOutput {
                    stdout: String::new(),
                    stderr: "cancelled".to_string(),
                    exit_code: None,
                    timed_out: false,
                    cancelled: true,
                })
            }
        }
    }
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

struct UsageFooter {
    cost_usd: f64,
    tokens_in: u64,
    tokens_out: u64,
    model_used: Option<String>,
}

fn usage_footer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"__TETORA_USAGE__(\{.*\})").unwrap())
}

fn parse_usage_footer(stdout: &str) -> Option<UsageFooter> {
    let caps = usage_footer_re().captures(stdout)?;
    let json: serde_json::Value = serde_json::from_str(&caps[1]).ok()?;
    Some(UsageFooter {
        cost_usd: json.get("cost_usd")?.as_f64()?,
        tokens_in: json.get("tokens_in").and_then(|v| v.as_u64()).unwrap_or(0),
        tokens_out: json.get("tokens_out").and_then(|v| v.as_u64()).unwrap_or(0),
        model_used: json.get("model_used").and_then(|v| v.as_str()).map(str::to_string),
    })
}

/// Coarse token estimate used only when the provider omits a usage footer:
/// ~4 characters per token.
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

#[derive(Clone)]
pub struct TaskRunner {
    db: Db,
    provider: Arc<dyn Provider>,
    semaphore: Arc<Semaphore>,
    knowledge: Option<Arc<dyn KnowledgeSearch + Send + Sync>>,
    job_states: HashMap<String, JobState>,
}

impl TaskRunner {
    pub fn new(db: Db, provider: Arc<dyn Provider>, max_concurrent: usize) -> Self {
        Self {
            db,
            provider,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            knowledge: None,
            job_states: HashMap::new(),
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeSearch + Send + Sync>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn note_job_state(&mut self, job_id: &str, state: JobState) {
        self.job_states.insert(job_id.to_string(), state);
    }

    /// Run a task to completion with no external cancellation handle — the
    /// common case for callers (daemon loop, router, skills, board, cron's
    /// own retry loop) that never need to interrupt an in-flight task.
    pub async fn run(&self, task: Task) -> Result<TaskResult, RunnerError> {
        self.run_with_cancel(task, CancellationToken::new()).await
    }

    /// Run a task to completion, honoring `cancel`: if it fires mid-flight
    /// the provider is asked to tear down its subprocess and the result is
    /// recorded as [`TaskStatus::Cancelled`].
    pub async fn run_with_cancel(&self, mut task: Task, cancel: CancellationToken) -> Result<TaskResult, RunnerError> {
        let _permit = self.semaphore.clone().acquire_owned().await.map_err(|_| RunnerError::SemaphoreClosed)?;

        task.prompt = template::expand(&task.prompt, task.job_id.as_deref(), &self.job_states, self.knowledge.as_deref().map(|k| k as &dyn KnowledgeSearch));

        let started = Instant::now();
        let raw = self.provider.invoke(&task, &cancel).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, error) = if raw.cancelled {
            (TaskStatus::Cancelled, Some("cancelled".to_string()))
        } else if raw.timed_out {
            (TaskStatus::Timeout, Some("timed out".to_string()))
        } else {
            match raw.exit_code {
                Some(0) => (TaskStatus::Success, None),
                Some(code) => (TaskStatus::Error, Some(format!("exit code {code}"))),
                None => (TaskStatus::Error, Some("process terminated without exit code".to_string())),
            }
        };

        let footer = parse_usage_footer(&raw.stdout);
        let (cost_usd, tokens_in, tokens_out, model_used) = match footer {
            Some(f) => (f.cost_usd, f.tokens_in, f.tokens_out, f.model_used.unwrap_or_else(|| task.model.clone())),
            None => (0.0, estimate_tokens(&task.prompt), estimate_tokens(&raw.stdout), task.model.clone()),
        };
        let session_id = task.session_id;

        let result = TaskResult {
            task_id: task.id.clone(),
            status,
            exit_code: raw.exit_code,
            output: raw.stdout,
            error,
            cost_usd,
            tokens_in,
            tokens_out,
            model_used,
            duration_ms,
            session_id,
            output_file: None,
        };

        let task_json = serde_json::json!({
            "id": task.id,
            "name": task.name,
            "agent": task.agent,
            "model": task.model,
            "source": task.source,
        })
        .to_string();

        let session_id_str = session_id.map(|id| id.to_string());

        self.db
            .history_insert(HistoryInsert {
                task_id: &result.task_id,
                name: &task.name,
                source: &task.source,
                agent: &task.agent,
                task_json: &task_json,
                status: result.status.as_str(),
                exit_code: result.exit_code.map(|c| c as i64),
                output: Some(&result.output),
                error: result.error.as_deref(),
                cost_usd: result.cost_usd,
                tokens_in: result.tokens_in as i64,
                tokens_out: result.tokens_out as i64,
                model_used: Some(&result.model_used),
                duration_ms: result.duration_ms as i64,
                session_id: session_id_str.as_deref(),
                output_file: None,
                started_at: now_ms().saturating_sub(duration_ms),
                finished_at: Some(now_ms()),
            })
            .await?;

        if let Some(session_id) = session_id {
            let role = if result.status.is_success() { "assistant" } else { "system" };
            let _ = self
                .db
                .session_add_message(
                    session_id,
                    role,
                    &result.output,
                    Some(result.cost_usd),
                    Some(result.tokens_in as i64),
                    Some(result.tokens_out as i64),
                    Some(&result.model_used),
                    Some(&task.id),
                )
                .await;
        }

        Ok(result)
    }

    /// Summarizes and collapses a session's oldest messages once it grows
    /// past `high_water`, so long-running conversations don't carry
    /// unbounded history into every future prompt. Fire-and-forget: a
    /// compaction failure is logged and otherwise harmless, since the
    /// session just keeps growing until the next successful attempt.
    pub async fn maybe_compact_session(&self, session_id: i64, high_water: i64) {
        let stale = match self.db.session_oldest_messages_for_compaction(session_id, high_water).await {
            Ok(rows) if !rows.is_empty() => rows,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(%err, session_id, "compaction: failed to load oldest messages");
                return;
            }
        };

        let ids: Vec<i64> = stale.iter().map(|m| m.id).collect();
        let transcript = stale.iter().map(|m| format!("{}: {}", m.role, m.content)).collect::<Vec<_>>().join("\n");
        let model = stale.iter().rev().find_map(|m| m.model.clone()).unwrap_or_else(|| "gpt-5".to_string());

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("session-compact:{session_id}"),
            prompt: format!(
                "Summarize the following conversation excerpt in a few sentences, preserving facts and decisions a later reply would need:\n\n{transcript}"
            ),
            workdir: std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from(".")),
            model,
            provider: None,
            timeout: std::time::Duration::from_secs(120),
            budget_usd: None,
            permission_mode: "auto".to_string(),
            extra_dirs: vec![],
            source: "compaction".to_string(),
            system_prompt: None,
            session_id: None,
            mcp_bundle: None,
            agent: "compactor".to_string(),
            job_id: None,
        };

        match self.run(task).await {
            Ok(result) if result.status.is_success() => {
                if let Err(err) = self.db.session_replace_with_summary(session_id, &ids, &result.output).await {
                    tracing::warn!(%err, session_id, "compaction: failed to replace messages with summary");
                }
            }
            Ok(result) => tracing::warn!(session_id, status = ?result.status, "compaction: summarization task did not succeed"),
            Err(err) => tracing::warn!(%err, session_id, "compaction: summarization task errored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    struct StubProvider {
        stdout: String,
        exit_code: Option<i32>,
        timed_out: bool,
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn invoke(&self, _task: &Task, _cancel: &CancellationToken) -> Result<RawOutput, RunnerError> {
            Ok(RawOutput {
                stdout: self.stdout.clone(),
                stderr: String::new(),
                exit_code: self.exit_code,
                timed_out: self.timed_out,
                cancelled: false,
            })
        }
    }

    fn sample_task() -> Task {
        Task {
            id: "task-1".to_string(),
            name: "test task".to_string(),
            prompt: "hello {{env.NONEXISTENT_TETORA_VAR}}".to_string(),
            workdir: PathBuf::from("."),
            model: "gpt-5".to_string(),
            provider: None,
            timeout: Duration::from_secs(30),
            budget_usd: None,
            permission_mode: "auto".to_string(),
            extra_dirs: vec![],
            source: "ask".to_string(),
            system_prompt: None,
            session_id: None,
            mcp_bundle: None,
            agent: "writer".to_string(),
            job_id: None,
        }
    }

    #[tokio::test]
    async fn test_success_path_persists_history() {
        let db = Db::open_memory().unwrap();
        let provider = Arc::new(StubProvider {
            stdout: "__TETORA_USAGE__{\"cost_usd\":0.02,\"tokens_in\":10,\"tokens_out\":20,\"model_used\":\"gpt-5\"}".to_string(),
            exit_code: Some(0),
            timed_out: false,
        });
        let runner = TaskRunner::new(db.clone(), provider, 2);
        let result = runner.run(sample_task()).await.unwrap();
        assert!(result.status.is_success());
        assert!((result.cost_usd - 0.02).abs() < 1e-9);
        let recent = db.history_recent(None, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].task_id, "task-1");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_status() {
        let db = Db::open_memory().unwrap();
        let provider = Arc::new(StubProvider {
            stdout: "boom".to_string(),
            exit_code: Some(1),
            timed_out: false,
        });
        let runner = TaskRunner::new(db, provider, 2);
        let result = runner.run(sample_task()).await.unwrap();
        assert_eq!(result.status, TaskStatus::Error);
        assert!(result.error.unwrap().contains("exit code 1"));
    }

    #[tokio::test]
    async fn test_timeout_status() {
        let db = Db::open_memory().unwrap();
        let provider = Arc::new(StubProvider {
            stdout: String::new(),
            exit_code: None,
            timed_out: true,
        });
        let runner = TaskRunner::new(db, provider, 2);
        let result = runner.run(sample_task()).await.unwrap();
        assert_eq!(result.status, TaskStatus::Timeout);
    }

    #[tokio::test]
    async fn test_fallback_token_estimate_when_no_usage_footer() {
        let db = Db::open_memory().unwrap();
        let provider = Arc::new(StubProvider {
            stdout: "plain output with no footer".to_string(),
            exit_code: Some(0),
            timed_out: false,
        });
        let runner = TaskRunner::new(db, provider, 2);
        let result = runner.run(sample_task()).await.unwrap();
        assert_eq!(result.cost_usd, 0.0);
        assert!(result.tokens_out > 0);
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() {
        let db = Db::open_memory().unwrap();
        let provider = Arc::new(StubProvider {
            stdout: "ok".to_string(),
            exit_code: Some(0),
            timed_out: false,
        });
        let runner = Arc::new(TaskRunner::new(db, provider, 1));
        assert_eq!(runner.semaphore.available_permits(), 1);
        let r1 = runner.clone();
        let mut t1 = sample_task();
        t1.id = "a".to_string();
        let h = tokio::spawn(async move { r1.run(t1).await });
        let result = h.await.unwrap().unwrap();
        assert!(result.status.is_success());
        assert_eq!(runner.semaphore.available_permits(), 1);
    }

    struct SlowProvider;

    #[async_trait]
    impl Provider for SlowProvider {
        async fn invoke(&self, _task: &Task, cancel: &CancellationToken) -> Result<RawOutput, RunnerError> {
            cancel.cancelled().await;
            Ok(RawOutput {
                stdout: String::new(),
                stderr: "cancelled".to_string(),
                exit_code: None,
                timed_out: false,
                cancelled: true,
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_marks_task_cancelled() {
        let db = Db::open_memory().unwrap();
        let runner = TaskRunner::new(db, Arc::new(SlowProvider), 2);
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move { runner.run_with_cancel(sample_task(), child).await });
        token.cancel();
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_maybe_compact_session_collapses_oldest_messages() {
        let db = Db::open_memory().unwrap();
        let session = db.session_get_or_create("ask", "compact-test", Some("writer"), None).await.unwrap();
        for i in 0..10 {
            db.session_add_message(session.id, "user", &format!("message {i}"), None, None, None, None, None).await.unwrap();
        }
        let provider = Arc::new(StubProvider {
            stdout: "conversation covered topics A and B".to_string(),
            exit_code: Some(0),
            timed_out: false,
        });
        let runner = TaskRunner::new(db.clone(), provider, 2);
        runner.maybe_compact_session(session.id, 3).await;

        let messages = db.session_messages(session.id, 50).await.unwrap();
        assert_eq!(messages.len(), 4, "7 oldest collapsed into 1 summary, 3 most recent kept");
        assert!(messages.iter().any(|m| m.role == "system" && m.content.contains("[summary]")));
    }

    #[tokio::test]
    async fn test_maybe_compact_session_is_noop_below_high_water() {
        let db = Db::open_memory().unwrap();
        let session = db.session_get_or_create("ask", "compact-noop", Some("writer"), None).await.unwrap();
        db.session_add_message(session.id, "user", "only one message", None, None, None, None, None).await.unwrap();
        let provider = Arc::new(StubProvider { stdout: String::new(), exit_code: Some(0), timed_out: false });
        let runner = TaskRunner::new(db.clone(), provider, 2);
        runner.maybe_compact_session(session.id, 200).await;

        let messages = db.session_messages(session.id, 50).await.unwrap();
        assert_eq!(messages.len(), 1);
    }
}
