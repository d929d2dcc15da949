//! Task board poller (C10): the business-logic half of the shared task
//! board, distinct from the storage-only [`crate::db::board`]. Polls for
//! `todo`-with-assignee rows, claims them atomically, runs them through the
//! task runner, and requeues failed rows for retry.

use crate::db::board::BoardTask;
use crate::db::Db;
use crate::runner::TaskRunner;
use crate::task::Task;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

pub struct BoardDispatcher {
    db: Db,
    runner: TaskRunner,
    poll_interval: Duration,
    default_model: String,
    workdir_root: PathBuf,
}

impl BoardDispatcher {
    pub fn new(db: Db, runner: TaskRunner, poll_interval: Duration, default_model: String, workdir_root: PathBuf) -> Self {
        Self {
            db,
            runner,
            poll_interval,
            default_model,
            workdir_root,
        }
    }

    /// Spawn the poll loop; stops when `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    fn build_task(&self, board_task: &BoardTask) -> Task {
        Task {
            id: format!("board-{}", board_task.id),
            name: board_task.title.clone(),
            prompt: board_task.description.clone(),
            workdir: self.workdir_root.clone(),
            model: board_task.model_override.clone().unwrap_or_else(|| self.default_model.clone()),
            provider: None,
            timeout: Duration::from_secs(600),
            budget_usd: None,
            permission_mode: "auto".to_string(),
            extra_dirs: vec![],
            source: "taskboard".to_string(),
            system_prompt: None,
            session_id: None,
            mcp_bundle: None,
            agent: board_task.assignee.clone().unwrap_or_default(),
            job_id: None,
        }
    }

    /// One poll pass: claim and run every eligible candidate (each isolated
    /// behind [`FutureExt::catch_unwind`] so one candidate panicking can't
    /// take the rest of the batch down), then requeue anything that failed
    /// on a prior pass.
    pub async fn tick(&self) {
        let candidates = match self.db.board_tasks_todo_assigned().await {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(%err, "board poll: failed to list candidates");
                return;
            }
        };

        let mut set = JoinSet::new();
        for candidate in candidates {
            match self.db.board_task_claim(candidate.id).await {
                Ok(true) => {
                    let id = candidate.id;
                    let task = self.build_task(&candidate);
                    let runner = self.runner.clone();
                    let db = self.db.clone();
                    set.spawn(async move {
                        let outcome = AssertUnwindSafe(runner.run(task)).catch_unwind().await;
                        match outcome {
                            Ok(Ok(result)) => {
                                let session_id_str = result.session_id.map(|sid| sid.to_string());
                                let _ = db
                                    .board_task_finish(
                                        id,
                                        result.status.is_success(),
                                        Some(result.cost_usd),
                                        Some(result.duration_ms as i64),
                                        session_id_str.as_deref(),
                                        Some(&result.output),
                                    )
                                    .await;
                            }
                            Ok(Err(err)) => {
                                let _ = db.board_task_finish(id, false, None, None, None, Some(&err.to_string())).await;
                            }
                            Err(_) => {
                                tracing::error!(id, "board poll: candidate task panicked");
                                let _ = db.board_task_finish(id, false, None, None, None, Some("panicked")).await;
                            }
                        }
                    });
                }
                Ok(false) => continue,
                Err(err) => tracing::error!(%err, id = candidate.id, "board poll: claim failed"),
            }
        }
        while set.join_next().await.is_some() {}

        match self.db.board_tasks_failed().await {
            Ok(failed) => {
                for row in failed {
                    if let Err(err) = self.db.board_task_requeue(row.id).await {
                        tracing::error!(%err, id = row.id, "board poll: requeue failed");
                    }
                }
            }
            Err(err) => tracing::error!(%err, "board poll: failed to list failed tasks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{Provider, RawOutput, RunnerError};
    use async_trait::async_trait;

    struct StubProvider {
        exit_code: Option<i32>,
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn invoke(&self, _task: &Task, _cancel: &CancellationToken) -> Result<RawOutput, RunnerError> {
            Ok(RawOutput {
                stdout: "done".to_string(),
                stderr: String::new(),
                exit_code: self.exit_code,
                timed_out: false,
                cancelled: false,
            })
        }
    }

    struct PanicProvider;

    #[async_trait]
    impl Provider for PanicProvider {
        async fn invoke(&self, _task: &Task, _cancel: &CancellationToken) -> Result<RawOutput, RunnerError> {
            panic!("boom")
        }
    }

    async fn dispatcher_with(exit_code: Option<i32>) -> (BoardDispatcher, Db) {
        let db = Db::open_memory().unwrap();
        let runner = TaskRunner::new(db.clone(), Arc::new(StubProvider { exit_code }), 2);
        let dispatcher = BoardDispatcher::new(db.clone(), runner, Duration::from_secs(1), "gpt-5".to_string(), PathBuf::from("."));
        (dispatcher, db)
    }

    #[tokio::test]
    async fn test_tick_claims_and_finishes_success() {
        let (dispatcher, db) = dispatcher_with(Some(0)).await;
        let id = db.board_task_create("t1", "do the thing", Some("writer"), None).await.unwrap();
        // Move to todo so it's eligible; board_task_create lands in backlog per storage-layer contract.
        db.exec_sync(|conn| {
            conn.execute("UPDATE board_tasks SET status = 'todo' WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
        .unwrap();

        dispatcher.tick().await;

        let row = db.board_task_get(id).await.unwrap().unwrap();
        assert_eq!(row.status, "done");
    }

    #[tokio::test]
    async fn test_tick_requeues_failed() {
        let (dispatcher, db) = dispatcher_with(Some(1)).await;
        let id = db.board_task_create("t2", "will fail", Some("writer"), None).await.unwrap();
        db.exec_sync(|conn| {
            conn.execute("UPDATE board_tasks SET status = 'todo' WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
        .unwrap();

        dispatcher.tick().await;
        let after_fail = db.board_task_get(id).await.unwrap().unwrap();
        assert_eq!(after_fail.status, "failed");

        dispatcher.tick().await;
        let after_requeue = db.board_task_get(id).await.unwrap().unwrap();
        assert_eq!(after_requeue.status, "todo");
    }

    #[tokio::test]
    async fn test_unassigned_task_is_not_claimed() {
        let (dispatcher, db) = dispatcher_with(Some(0)).await;
        let id = db.board_task_create("t3", "no assignee", None, None).await.unwrap();
        db.exec_sync(|conn| {
            conn.execute("UPDATE board_tasks SET status = 'todo' WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
        .unwrap();

        dispatcher.tick().await;
        let row = db.board_task_get(id).await.unwrap().unwrap();
        assert_eq!(row.status, "todo");
    }

    #[tokio::test]
    async fn test_panicking_candidate_is_isolated_and_marked_failed() {
        let db = Db::open_memory().unwrap();
        let runner = TaskRunner::new(db.clone(), Arc::new(PanicProvider), 2);
        let dispatcher = BoardDispatcher::new(db.clone(), runner, Duration::from_secs(1), "gpt-5".to_string(), PathBuf::from("."));

        let panic_id = db.board_task_create("t5", "panics", Some("writer"), None).await.unwrap();
        db.exec_sync(|conn| {
            conn.execute("UPDATE board_tasks SET status = 'todo' WHERE id = ?1", rusqlite::params![panic_id])?;
            Ok(())
        })
        .unwrap();

        // tick() must survive the panicking candidate rather than propagating it.
        dispatcher.tick().await;

        let panic_row = db.board_task_get(panic_id).await.unwrap().unwrap();
        assert_eq!(panic_row.status, "failed");
        assert_eq!(panic_row.comment.as_deref(), Some("panicked"));
    }
}
