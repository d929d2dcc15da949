//! Dispatch orchestrator (C8): fans a batch of Tasks out across the runner,
//! rejecting a new dispatch while one is already active, and tracks the most
//! recent run's aggregate status for the CLI/web status surface.

use crate::runner::{RunnerError, TaskRunner};
use crate::task::{Task, TaskResult};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a dispatch is already in progress")]
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Running,
}

pub struct DispatchResult {
    pub results: Vec<Result<TaskResult, RunnerError>>,
}

struct Active {
    state: DispatchState,
    started_at: Option<std::time::Instant>,
    finished: usize,
    total: usize,
}

impl Default for Active {
    fn default() -> Self {
        Active {
            state: DispatchState::Idle,
            started_at: None,
            finished: 0,
            total: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchStatus {
    pub state: DispatchState,
    pub finished: usize,
    pub total: usize,
}

/// Single dispatch singleton: at most one batch in flight at a time, per
/// spec's `dispatch.mu` resource.
pub struct Dispatcher {
    runner: TaskRunner,
    active: Arc<Mutex<Active>>,
    cancel_token: Arc<Mutex<Option<CancellationToken>>>,
}

impl Dispatcher {
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            runner,
            active: Arc::new(Mutex::new(Active::default())),
            cancel_token: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn status(&self) -> DispatchStatus {
        let active = self.active.lock().await;
        DispatchStatus {
            state: active.state,
            finished: active.finished,
            total: active.total,
        }
    }

    /// Cancel every task in the currently active dispatch batch, if any.
    /// A no-op when idle.
    pub async fn cancel(&self) {
        if let Some(token) = self.cancel_token.lock().await.as_ref() {
            token.cancel();
        }
    }

    /// Fan a batch of tasks out one runner invocation each, returning once
    /// every task has a terminal result. Rejects if a dispatch is already
    /// running.
    pub async fn dispatch(&self, tasks: Vec<Task>) -> Result<DispatchResult, DispatchError> {
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if active.state == DispatchState::Running {
                return Err(DispatchError::AlreadyActive);
            }
            active.state = DispatchState::Running;
            active.started_at = Some(std::time::Instant::now());
            active.finished = 0;
            active.total = tasks.len();
            *self.cancel_token.lock().await = Some(token.clone());
        }

        let mut set = JoinSet::new();
        for task in tasks {
            let runner = self.runner.clone();
            let task_token = token.clone();
            set.spawn(async move { runner.run_with_cancel(task, task_token).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(join_err) => Err(RunnerError::Spawn(std::io::Error::other(join_err.to_string()))),
            };
            results.push(result);
            let mut active = self.active.lock().await;
            active.finished += 1;
        }

        let mut active = self.active.lock().await;
        active.state = DispatchState::Idle;
        *self.cancel_token.lock().await = None;

        Ok(DispatchResult { results })
    }
}
