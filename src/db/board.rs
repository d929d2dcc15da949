use super::{now_ms, quote, Db, DbError};

/// A persisted Kanban-style work item (C10).
#[derive(Debug, Clone)]
pub struct BoardTask {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: String,
    pub assignee: Option<String>,
    pub project: Option<String>,
    pub model_override: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<i64>,
    pub session_id: Option<String>,
    pub comment: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn row_to_board_task(row: &rusqlite::Row) -> rusqlite::Result<BoardTask> {
    Ok(BoardTask {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        assignee: row.get(4)?,
        project: row.get(5)?,
        model_override: row.get(6)?,
        cost_usd: row.get(7)?,
        duration_ms: row.get(8)?,
        session_id: row.get(9)?,
        comment: row.get(10)?,
        created_at: row.get::<_, i64>(11)? as u64,
        updated_at: row.get::<_, i64>(12)? as u64,
    })
}

const BOARD_COLS: &str = "id, title, description, status, assignee, project, model_override, \
     cost_usd, duration_ms, session_id, comment, created_at, updated_at";

/// Comments (output/error) attached on completion are bounded to this many
/// characters (spec §4.10).
pub const MAX_COMMENT_CHARS: usize = 2000;

impl Db {
    pub async fn board_task_create(
        &self,
        title: &str,
        description: &str,
        assignee: Option<&str>,
        project: Option<&str>,
    ) -> Result<i64, DbError> {
        let title = title.to_string();
        let description = description.to_string();
        let assignee = assignee.map(|s| s.to_string());
        let project = project.map(|s| s.to_string());
        let ts = now_ms();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO board_tasks
                 (title, description, status, assignee, project, created_at, updated_at)
                 VALUES (?1, ?2, 'backlog', ?3, ?4, ?5, ?5)",
                rusqlite::params![title, description, assignee, project, ts as i64],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Atomic `todo -> doing` transition. Returns `true` iff this call
    /// performed the transition — concurrent dispatchers racing the same row
    /// see only one winner, since the UPDATE's WHERE clause re-checks status.
    pub async fn board_task_claim(&self, id: i64) -> Result<bool, DbError> {
        self.exec(move |conn| {
            let n = conn.execute(
                "UPDATE board_tasks SET status = 'doing', updated_at = ?1
                 WHERE id = ?2 AND status = 'todo' AND assignee IS NOT NULL AND assignee != ''",
                rusqlite::params![now_ms() as i64, id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn board_tasks_todo_assigned(&self) -> Result<Vec<BoardTask>, DbError> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BOARD_COLS} FROM board_tasks
                 WHERE status = 'todo' AND assignee IS NOT NULL AND assignee != ''",
            ))?;
            let rows = stmt.query_map([], row_to_board_task)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Finish a claimed task: attach result metadata, bounded comment, and
    /// transition to `done` or `failed`.
    pub async fn board_task_finish(
        &self,
        id: i64,
        success: bool,
        cost_usd: Option<f64>,
        duration_ms: Option<i64>,
        session_id: Option<&str>,
        comment: Option<&str>,
    ) -> Result<(), DbError> {
        let status = if success { "done" } else { "failed" };
        let session_id = session_id.map(|s| s.to_string());
        let comment = comment.map(|c| {
            if c.chars().count() > MAX_COMMENT_CHARS {
                c.chars().take(MAX_COMMENT_CHARS).collect::<String>() + "…"
            } else {
                c.to_string()
            }
        });
        self.exec(move |conn| {
            conn.execute(
                "UPDATE board_tasks SET
                   status = ?1, cost_usd = ?2, duration_ms = ?3, session_id = ?4,
                   comment = ?5, updated_at = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    status,
                    cost_usd,
                    duration_ms,
                    session_id,
                    comment,
                    now_ms() as i64,
                    id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn board_tasks_failed(&self) -> Result<Vec<BoardTask>, DbError> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {BOARD_COLS} FROM board_tasks WHERE status = 'failed'"))?;
            let rows = stmt.query_map([], row_to_board_task)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Re-enqueue a failed board task back to `todo` for a retry sweep.
    pub async fn board_task_requeue(&self, id: i64) -> Result<(), DbError> {
        self.exec(move |conn| {
            conn.execute(
                "UPDATE board_tasks SET status = 'todo', updated_at = ?1 WHERE id = ?2 AND status = 'failed'",
                rusqlite::params![now_ms() as i64, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn board_task_get(&self, id: i64) -> Result<Option<BoardTask>, DbError> {
        self.exec(move |conn| {
            let result = conn.query_row(
                &format!("SELECT {BOARD_COLS} FROM board_tasks WHERE id = {id}"),
                [],
                row_to_board_task,
            );
            match result {
                Ok(t) => Ok(Some(t)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn board_tasks_by_status(&self, status: &str) -> Result<Vec<BoardTask>, DbError> {
        let status = status.to_string();
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BOARD_COLS} FROM board_tasks WHERE status = {} ORDER BY updated_at DESC",
                quote(&status),
            ))?;
            let rows = stmt.query_map([], row_to_board_task)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_claim() {
        let db = Db::open_memory().unwrap();
        let id = db
            .board_task_create("fix bug", "the thing is broken", Some("coder"), None)
            .await
            .unwrap();
        // Newly created tasks start in backlog, not todo, so the claim misses.
        assert!(!db.board_task_claim(id).await.unwrap());

        db.exec_sync(|conn| {
            conn.execute("UPDATE board_tasks SET status = 'todo'", [])?;
            Ok(())
        })
        .unwrap();

        assert!(db.board_task_claim(id).await.unwrap());
        let task = db.board_task_get(id).await.unwrap().unwrap();
        assert_eq!(task.status, "doing");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let db = Db::open_memory().unwrap();
        let id = db
            .board_task_create("one task", "", Some("coder"), None)
            .await
            .unwrap();
        db.exec_sync(|conn| {
            conn.execute("UPDATE board_tasks SET status = 'todo'", [])?;
            Ok(())
        })
        .unwrap();

        // Two "dispatchers" race the same row; only one should win.
        let a = db.board_task_claim(id).await.unwrap();
        let b = db.board_task_claim(id).await.unwrap();
        assert!(a);
        assert!(!b);
    }

    #[tokio::test]
    async fn test_finish_truncates_long_comment() {
        let db = Db::open_memory().unwrap();
        let id = db.board_task_create("t", "", Some("a"), None).await.unwrap();
        let long_comment = "x".repeat(3000);
        db.board_task_finish(id, true, Some(0.5), Some(1000), None, Some(&long_comment))
            .await
            .unwrap();
        let task = db.board_task_get(id).await.unwrap().unwrap();
        assert_eq!(task.status, "done");
        assert!(task.comment.unwrap().chars().count() <= MAX_COMMENT_CHARS + 1);
    }

    #[tokio::test]
    async fn test_requeue_failed() {
        let db = Db::open_memory().unwrap();
        let id = db.board_task_create("t", "", Some("a"), None).await.unwrap();
        db.board_task_finish(id, false, None, None, None, Some("boom")).await.unwrap();
        db.board_task_requeue(id).await.unwrap();
        let task = db.board_task_get(id).await.unwrap().unwrap();
        assert_eq!(task.status, "todo");
    }
}
