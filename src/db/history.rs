use super::{now_ms, quote, Db, DbError};

/// Terminal record of one Task execution (C7 write-back). Immutable once written.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub id: i64,
    pub task_id: String,
    pub name: String,
    pub source: String,
    pub agent: String,
    pub task_json: String,
    pub status: String,
    pub exit_code: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cost_usd: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub model_used: Option<String>,
    pub duration_ms: i64,
    pub session_id: Option<String>,
    pub output_file: Option<String>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

/// Fields needed to insert a finished history row. Mirrors `TaskResult` plus
/// the identifying fields a `Task` carries.
pub struct HistoryInsert<'a> {
    pub task_id: &'a str,
    pub name: &'a str,
    pub source: &'a str,
    pub agent: &'a str,
    pub task_json: &'a str,
    pub status: &'a str,
    pub exit_code: Option<i64>,
    pub output: Option<&'a str>,
    pub error: Option<&'a str>,
    pub cost_usd: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub model_used: Option<&'a str>,
    pub duration_ms: i64,
    pub session_id: Option<&'a str>,
    pub output_file: Option<&'a str>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

fn row_to_history(row: &rusqlite::Row) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        name: row.get(2)?,
        source: row.get(3)?,
        agent: row.get(4)?,
        task_json: row.get(5)?,
        status: row.get(6)?,
        exit_code: row.get(7)?,
        output: row.get(8)?,
        error: row.get(9)?,
        cost_usd: row.get(10)?,
        tokens_in: row.get(11)?,
        tokens_out: row.get(12)?,
        model_used: row.get(13)?,
        duration_ms: row.get(14)?,
        session_id: row.get(15)?,
        output_file: row.get(16)?,
        started_at: row.get::<_, i64>(17)? as u64,
        finished_at: row.get::<_, Option<i64>>(18)?.map(|v| v as u64),
    })
}

const HISTORY_COLS: &str = "id, task_id, name, source, agent, task_json, status, exit_code, output, error, \
     cost_usd, tokens_in, tokens_out, model_used, duration_ms, session_id, output_file, started_at, finished_at";

impl Db {
    pub async fn history_insert(&self, row: HistoryInsert<'_>) -> Result<i64, DbError> {
        let task_id = row.task_id.to_string();
        let name = row.name.to_string();
        let source = row.source.to_string();
        let agent = row.agent.to_string();
        let task_json = row.task_json.to_string();
        let status = row.status.to_string();
        let exit_code = row.exit_code;
        let output = row.output.map(|s| s.to_string());
        let error = row.error.map(|s| s.to_string());
        let cost_usd = row.cost_usd;
        let tokens_in = row.tokens_in;
        let tokens_out = row.tokens_out;
        let model_used = row.model_used.map(|s| s.to_string());
        let duration_ms = row.duration_ms;
        let session_id = row.session_id.map(|s| s.to_string());
        let output_file = row.output_file.map(|s| s.to_string());
        let started_at = row.started_at;
        let finished_at = row.finished_at;
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO history
                 (task_id, name, source, agent, task_json, status, exit_code, output, error,
                  cost_usd, tokens_in, tokens_out, model_used, duration_ms, session_id, output_file,
                  started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                rusqlite::params![
                    task_id,
                    name,
                    source,
                    agent,
                    task_json,
                    status,
                    exit_code,
                    output,
                    error,
                    cost_usd,
                    tokens_in,
                    tokens_out,
                    model_used,
                    duration_ms,
                    session_id,
                    output_file,
                    started_at as i64,
                    finished_at.map(|v| v as i64),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn history_recent(&self, agent: Option<&str>, limit: usize) -> Result<Vec<HistoryRow>, DbError> {
        let agent = agent.map(|s| s.to_string());
        self.exec(move |conn| {
            let sql = match &agent {
                Some(a) => format!(
                    "SELECT {HISTORY_COLS} FROM history WHERE agent = {} ORDER BY started_at DESC LIMIT {}",
                    quote(a),
                    limit,
                ),
                None => format!("SELECT {HISTORY_COLS} FROM history ORDER BY started_at DESC LIMIT {limit}"),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_history)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Sum `cost_usd` for rows started at or after `since_ms`, optionally
    /// filtered by agent or model — backs the `usage` CLI rollup.
    pub async fn history_cost_since(
        &self,
        since_ms: u64,
        agent: Option<&str>,
        model: Option<&str>,
    ) -> Result<f64, DbError> {
        let agent = agent.map(|s| s.to_string());
        let model = model.map(|s| s.to_string());
        self.exec(move |conn| {
            let mut sql = format!("SELECT COALESCE(SUM(cost_usd), 0) FROM history WHERE started_at >= {since_ms}");
            if let Some(a) = &agent {
                sql.push_str(&format!(" AND agent = {}", quote(a)));
            }
            if let Some(m) = &model {
                sql.push_str(&format!(" AND model_used = {}", quote(m)));
            }
            let total: f64 = conn.query_row(&sql, [], |r| r.get(0))?;
            Ok(total)
        })
        .await
    }

    pub async fn history_purge_before(&self, cutoff_ms: u64) -> Result<usize, DbError> {
        self.exec(move |conn| {
            let n = conn.execute(
                "DELETE FROM history WHERE started_at < ?1",
                rusqlite::params![cutoff_ms as i64],
            )?;
            Ok(n)
        })
        .await
    }
}
