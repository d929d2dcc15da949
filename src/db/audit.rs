use super::{now_ms, Db, DbError};

/// A single audit log row (C2). Rows are appended by [`audit::AuditWriter`],
/// never inserted directly by callers — this module only owns storage and
/// query shape.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub timestamp: u64,
    pub action: String,
    pub source: String,
    pub detail: Option<String>,
    pub client_ip: Option<String>,
}

impl Db {
    /// Insert a single audit row. Used directly only by tests and by the
    /// batching writer's fallback path; the hot path goes through
    /// `Db::exec_batch` with a joined multi-row INSERT.
    pub async fn audit_insert(
        &self,
        action: &str,
        source: &str,
        detail: Option<&str>,
        client_ip: Option<&str>,
    ) -> Result<(), DbError> {
        let action = action.to_string();
        let source = source.to_string();
        let detail = detail.map(|s| s.to_string());
        let client_ip = client_ip.map(|s| s.to_string());
        let ts = now_ms();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (timestamp, action, source, detail, client_ip)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![ts as i64, action, source, detail, client_ip],
            )?;
            Ok(())
        })
        .await
    }

    /// Query audit entries, newest first.
    pub async fn audit_query(&self, limit: usize) -> Result<Vec<AuditEntry>, DbError> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, action, source, detail, client_ip
                 FROM audit_log ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![limit as i64], |row| {
                    Ok(AuditEntry {
                        id: Some(row.get(0)?),
                        timestamp: row.get::<_, i64>(1)? as u64,
                        action: row.get(2)?,
                        source: row.get(3)?,
                        detail: row.get(4)?,
                        client_ip: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Delete audit rows older than `cutoff_ms` (spec §6 retention / `data cleanup`).
    pub async fn audit_purge_before(&self, cutoff_ms: u64) -> Result<usize, DbError> {
        self.exec(move |conn| {
            let n = conn.execute(
                "DELETE FROM audit_log WHERE timestamp < ?1",
                rusqlite::params![cutoff_ms as i64],
            )?;
            Ok(n)
        })
        .await
    }
}

/// Milliseconds since epoch at start of today (UTC).
pub fn today_start_ms() -> u64 {
    let now = chrono::Utc::now();
    let today = now.date_naive().and_hms_opt(0, 0, 0).unwrap();
    today.and_utc().timestamp_millis() as u64
}
