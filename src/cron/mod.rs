//! CronEngine (C9): the scheduler tick loop, per-job run orchestration
//! (approval gate, retry loop, consecutive-error tracking), and job CRUD.
//! The grammar/next-run algorithm lives in [`parser`]; this module owns
//! *when* a job runs and *what happens* when it does.

pub mod parser;

use crate::audit::AuditWriter;
use crate::db::cron::{CronJobInsert, CronJobRow};
use crate::db::Db;
use crate::notify::Notifier;
use crate::runner::TaskRunner;
use crate::task::Task;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parser::CronExpr;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

pub const TICK_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_CHAIN_DEPTH: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("store error: {0}")]
    Store(#[from] crate::db::DbError),
    #[error("invalid cron expression: {0}")]
    Parse(#[from] parser::CronError),
    #[error("job not found")]
    NotFound,
    #[error("job is currently running")]
    Busy,
}

struct RunningState {
    running: std::collections::HashSet<i64>,
}

/// The scheduler. Holds no task template knowledge beyond what it reads
/// back from the store on every tick.
pub struct CronEngine {
    db: Db,
    runner: TaskRunner,
    notifier: Option<Arc<dyn Notifier>>,
    audit: Arc<AuditWriter>,
    workdir_root: PathBuf,
    default_model: String,
    running: Mutex<RunningState>,
    pending_approvals: Mutex<HashMap<i64, oneshot::Sender<bool>>>,
}

impl CronEngine {
    pub fn new(
        db: Db,
        runner: TaskRunner,
        notifier: Option<Arc<dyn Notifier>>,
        audit: Arc<AuditWriter>,
        workdir_root: PathBuf,
        default_model: String,
    ) -> Self {
        Self {
            db,
            runner,
            notifier,
            audit,
            workdir_root,
            default_model,
            running: Mutex::new(RunningState { running: Default::default() }),
            pending_approvals: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(TICK_INTERVAL) => {
                        self.clone().tick().await;
                    }
                }
            }
        })
    }

    /// One scheduler pass: due + enabled + not-currently-running jobs get
    /// dispatched onto their own task. Double-fire is guarded by the
    /// `running` set, not by comparing timestamps (two ticks landing in the
    /// same minute must not both fire the same job).
    pub async fn tick(self: Arc<Self>) {
        let jobs = match self.db.cron_jobs_all().await {
            Ok(j) => j,
            Err(err) => {
                tracing::error!(%err, "cron tick: failed to list jobs");
                return;
            }
        };
        let now = Utc::now();
        for job in jobs {
            if !job.enabled {
                continue;
            }
            let tz: Tz = job.timezone.parse().unwrap_or(chrono_tz::UTC);
            let expr = match CronExpr::parse(&job.schedule) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(job = job.id, %err, "cron tick: unparsable schedule");
                    continue;
                }
            };
            let now_tz = now.with_timezone(&tz);
            if !expr.matches(&now_tz) {
                continue;
            }
            // Guard against refiring within the same matching minute.
            if let Some(last_run) = job.last_run {
                if now.timestamp_millis() as u64 - last_run < 60_000 {
                    continue;
                }
            }
            {
                let mut running = self.running.lock().await;
                if running.running.contains(&job.id) {
                    continue;
                }
                running.running.insert(job.id);
            }
            let engine = self.clone();
            tokio::spawn(async move { engine.run_job(job, 0).await });
        }
    }

    /// Build the Task from a job's stored template. `task_template_json` is
    /// a small object: `{"prompt": "...", "model": "...", "system_prompt": "..."}`.
    fn build_task(&self, job: &CronJobRow) -> Task {
        let template: serde_json::Value = serde_json::from_str(&job.task_template_json).unwrap_or(serde_json::json!({}));
        let prompt = template.get("prompt").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let model = template.get("model").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| self.default_model.clone());
        let system_prompt = template.get("system_prompt").and_then(|v| v.as_str()).map(str::to_string);

        Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: job.name.clone(),
            prompt,
            workdir: self.workdir_root.clone(),
            model,
            provider: None,
            timeout: Duration::from_secs(600),
            budget_usd: None,
            permission_mode: "auto".to_string(),
            extra_dirs: vec![],
            source: "cron".to_string(),
            system_prompt,
            session_id: None,
            mcp_bundle: None,
            agent: job.agent.clone().unwrap_or_default(),
            job_id: Some(job.id.to_string()),
        }
    }

    /// Run one job to completion: approval gate (depth 0 only), retry loop,
    /// write-back, notification, chain trigger. `depth` bounds chain
    /// recursion — a job whose completion triggers another job increments
    /// depth; past `MAX_CHAIN_DEPTH` the chain is cut and the truncation is
    /// audit-logged.
    pub async fn run_job(&self, job: CronJobRow, depth: u32) {
        if depth > MAX_CHAIN_DEPTH {
            tracing::warn!(job = job.id, depth, "cron: chain depth exceeded, aborting");
            self.audit.log("cron.chain_truncated", "cron", Some(&format!("job={} depth={depth}", job.id)), None);
            self.finish_running(job.id).await;
            return;
        }

        if job.requires_approval && depth == 0 {
            let (tx, rx) = oneshot::channel();
            self.pending_approvals.lock().await.insert(job.id, tx);
            let approved = tokio::time::timeout(Duration::from_secs(job.approval_timeout_secs), rx).await;
            self.pending_approvals.lock().await.remove(&job.id);
            match approved {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    self.record_and_notify(&job, false, Some("rejected by approver".to_string())).await;
                    self.trigger_chain(&job, false, depth).await;
                    self.finish_running(job.id).await;
                    return;
                }
                _ => {
                    self.record_and_notify(&job, false, Some("approval timed out".to_string())).await;
                    self.trigger_chain(&job, false, depth).await;
                    self.finish_running(job.id).await;
                    return;
                }
            }
        }

        let attempts = 1 + job.max_retries;
        let mut last_error = None;
        let mut success = false;
        for attempt in 0..attempts {
            let task = self.build_task(&job);
            match self.runner.run(task).await {
                Ok(result) if result.status.is_success() => {
                    success = true;
                    last_error = None;
                    break;
                }
                Ok(result) => last_error = result.error.or(Some(format!("task ended with status {}", result.status.as_str()))),
                Err(err) => last_error = Some(err.to_string()),
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(job.retry_delay_secs)).await;
            }
        }

        self.record_and_notify(&job, success, last_error).await;
        self.trigger_chain(&job, success, depth).await;
        self.finish_running(job.id).await;
    }

    /// Fire the `on_success`/`on_failure` chain for `job`'s outcome. Boxed so
    /// `run_job`'s own recursion through this helper doesn't need an
    /// infinitely-sized future.
    fn trigger_chain<'a>(&'a self, job: &'a CronJobRow, success: bool, depth: u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if depth + 1 > MAX_CHAIN_DEPTH {
                self.audit.log("cron.chain_truncated", "cron", Some(&format!("job={} depth={}", job.id, depth + 1)), None);
                return;
            }
            let ids_json = if success { &job.on_success_json } else { &job.on_failure_json };
            let child_ids: Vec<i64> = serde_json::from_str(ids_json).unwrap_or_default();
            for child_id in child_ids {
                let child = match self.db.cron_job_get(child_id).await {
                    Ok(Some(c)) if c.enabled => c,
                    Ok(Some(_)) => continue,
                    _ => continue,
                };
                {
                    let mut running = self.running.lock().await;
                    if running.running.contains(&child.id) {
                        continue;
                    }
                    running.running.insert(child.id);
                }
                self.run_job(child, depth + 1).await;
            }
        })
    }

    async fn record_and_notify(&self, job: &CronJobRow, success: bool, error: Option<String>) {
        let tz: Tz = job.timezone.parse().unwrap_or(chrono_tz::UTC);
        let next_run = CronExpr::parse(&job.schedule).ok().and_then(|expr| {
            let now_tz: DateTime<Tz> = Utc::now().with_timezone(&tz);
            expr.next_run_after(&now_tz).map(|dt| dt.with_timezone(&Utc).timestamp_millis() as u64)
        });
        let now_ms = Utc::now().timestamp_millis() as u64;
        if let Err(err) = self.db.cron_job_record_run(job.id, next_run, now_ms, success, error.as_deref()).await {
            tracing::error!(%err, job = job.id, "cron: failed to record run");
        }
        if job.notify {
            if let Some(notifier) = &self.notifier {
                let text = if success {
                    format!("cron job '{}' finished successfully", job.name)
                } else {
                    format!("cron job '{}' failed: {}", job.name, error.unwrap_or_default())
                };
                notifier.send(&text).await;
            }
        }
    }

    async fn finish_running(&self, job_id: i64) {
        self.running.lock().await.running.remove(&job_id);
    }

    /// Resolve a pending approval gate. Returns `false` if no job is
    /// awaiting approval under this id.
    pub async fn approve_job(&self, job_id: i64, approve: bool) -> bool {
        if let Some(tx) = self.pending_approvals.lock().await.remove(&job_id) {
            tx.send(approve).is_ok()
        } else {
            false
        }
    }

    pub async fn add_job(&self, job: CronJobInsert<'_>) -> Result<i64, CronError> {
        CronExpr::parse(job.schedule)?;
        Ok(self.db.cron_job_create(job).await?)
    }

    pub async fn remove_job(&self, id: i64) -> Result<(), CronError> {
        let running = self.running.lock().await;
        if running.running.contains(&id) {
            return Err(CronError::Busy);
        }
        drop(running);
        self.db.cron_job_remove(id).await?;
        Ok(())
    }

    pub async fn enable_job(&self, id: i64, enabled: bool) -> Result<(), CronError> {
        self.db.cron_job_set_enabled(id, enabled).await?;
        Ok(())
    }

    pub async fn list_jobs(&self) -> Result<Vec<CronJobRow>, CronError> {
        Ok(self.db.cron_jobs_all().await?)
    }

    /// Manually trigger a job regardless of schedule (CLI `job trigger`).
    pub async fn trigger_job(&self, id: i64) -> Result<(), CronError> {
        let job = self.db.cron_job_get(id).await?.ok_or(CronError::NotFound)?;
        {
            let mut running = self.running.lock().await;
            if running.running.contains(&id) {
                return Err(CronError::Busy);
            }
            running.running.insert(id);
        }
        self.run_job(job, 0).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{Provider, RawOutput, RunnerError};
    use async_trait::async_trait;

    struct StubProvider {
        fail_first_n: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn invoke(&self, _task: &Task, _cancel: &CancellationToken) -> Result<RawOutput, RunnerError> {
            let remaining = self.fail_first_n.load(std::sync::atomic::Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first_n.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                Ok(RawOutput {
                    stdout: String::new(),
                    stderr: "boom".to_string(),
                    exit_code: Some(1),
                    timed_out: false,
                    cancelled: false,
                })
            } else {
                Ok(RawOutput {
                    stdout: "ok".to_string(),
                    stderr: String::new(),
                    exit_code: Some(0),
                    timed_out: false,
                    cancelled: false,
                })
            }
        }
    }

    fn engine_with(fail_first_n: usize) -> CronEngine {
        let db = Db::open_memory().unwrap();
        let runner = TaskRunner::new(db.clone(), Arc::new(StubProvider { fail_first_n: fail_first_n.into() }), 4);
        let audit = Arc::new(AuditWriter::spawn(db.clone()));
        CronEngine::new(db, runner, None, audit, PathBuf::from("."), "gpt-5".to_string())
    }

    fn sample_job_insert() -> CronJobInsert<'static> {
        CronJobInsert {
            name: "test-job",
            schedule: "30 3 * * *",
            timezone: "UTC",
            agent: Some("writer"),
            task_template_json: "{\"prompt\":\"hello\"}",
            notify: false,
            max_retries: 2,
            retry_delay_secs: 0,
            requires_approval: false,
            approval_timeout_secs: 1,
            on_success: &[],
            on_failure: &[],
        }
    }

    #[tokio::test]
    async fn test_retry_loop_succeeds_after_failures() {
        let engine = engine_with(2);
        let id = engine.add_job(sample_job_insert()).await.unwrap();
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        engine.run_job(job, 0).await;
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        assert_eq!(job.consecutive_errors, 0);
        assert!(job.last_run.is_some());
    }

    #[tokio::test]
    async fn test_exhausts_retries_and_records_failure() {
        let engine = engine_with(10);
        let mut insert = sample_job_insert();
        insert.max_retries = 1;
        let id = engine.add_job(insert).await.unwrap();
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        engine.run_job(job, 0).await;
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        assert_eq!(job.consecutive_errors, 1);
        assert!(job.last_error.is_some());
    }

    #[tokio::test]
    async fn test_approval_timeout_fails_job_without_running_task() {
        let engine = engine_with(0);
        let mut insert = sample_job_insert();
        insert.requires_approval = true;
        insert.approval_timeout_secs = 1;
        let id = engine.add_job(insert).await.unwrap();
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        engine.run_job(job, 0).await;
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_approve_job_unblocks_pending_run() {
        let engine = Arc::new(engine_with(0));
        let mut insert = sample_job_insert();
        insert.requires_approval = true;
        insert.approval_timeout_secs = 5;
        let id = engine.add_job(insert).await.unwrap();
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();

        let engine2 = engine.clone();
        let handle = tokio::spawn(async move { engine2.run_job(job, 0).await });
        // Give the run loop a moment to register the pending approval.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.approve_job(id, true).await);
        handle.await.unwrap();

        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        assert_eq!(job.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_chain_depth_cap_aborts_without_running() {
        let engine = engine_with(0);
        let insert = sample_job_insert();
        let id = engine.add_job(insert).await.unwrap();
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        engine.run_job(job, MAX_CHAIN_DEPTH + 1).await;
        // No run was recorded since the chain was cut before dispatch.
        let job = engine.db.cron_job_get(id).await.unwrap().unwrap();
        assert!(job.last_run.is_none());
    }

    #[tokio::test]
    async fn test_chain_triggers_on_success_runs_child_job() {
        let engine = engine_with(0);
        let child_id = engine.add_job(sample_job_insert()).await.unwrap();

        let parent_insert = CronJobInsert {
            name: "parent-job",
            schedule: "30 3 * * *",
            timezone: "UTC",
            agent: Some("writer"),
            task_template_json: "{\"prompt\":\"hello\"}",
            notify: false,
            max_retries: 0,
            retry_delay_secs: 0,
            requires_approval: false,
            approval_timeout_secs: 1,
            on_success: &[child_id],
            on_failure: &[],
        };
        let parent_id = engine.add_job(parent_insert).await.unwrap();
        let parent = engine.db.cron_job_get(parent_id).await.unwrap().unwrap();

        engine.run_job(parent, 0).await;

        let child = engine.db.cron_job_get(child_id).await.unwrap().unwrap();
        assert!(child.last_run.is_some(), "chained child job should have run after parent succeeded");
        assert_eq!(child.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_chain_does_not_trigger_on_success_list_when_job_fails() {
        let engine = engine_with(10);
        let child_id = engine.add_job(sample_job_insert()).await.unwrap();

        let parent_insert = CronJobInsert {
            name: "parent-job",
            schedule: "30 3 * * *",
            timezone: "UTC",
            agent: Some("writer"),
            task_template_json: "{\"prompt\":\"hello\"}",
            notify: false,
            max_retries: 0,
            retry_delay_secs: 0,
            requires_approval: false,
            approval_timeout_secs: 1,
            on_success: &[child_id],
            on_failure: &[],
        };
        let parent_id = engine.add_job(parent_insert).await.unwrap();
        let parent = engine.db.cron_job_get(parent_id).await.unwrap().unwrap();

        engine.run_job(parent, 0).await;

        let child = engine.db.cron_job_get(child_id).await.unwrap().unwrap();
        assert!(child.last_run.is_none(), "on_success chain must not fire when the parent job failed");
    }
}
