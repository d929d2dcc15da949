use super::{now_ms, quote, Db, DbError};

/// A recorded trust-level transition (C3). Append-only.
#[derive(Debug, Clone)]
pub struct TrustEvent {
    pub id: Option<i64>,
    pub agent: String,
    pub event_type: String,
    pub from_level: String,
    pub to_level: String,
    pub consecutive_success: i64,
    pub note: Option<String>,
    pub timestamp: u64,
}

impl Db {
    /// Append a trust transition record.
    pub async fn trust_event_insert(
        &self,
        agent: &str,
        event_type: &str,
        from_level: &str,
        to_level: &str,
        consecutive_success: i64,
        note: Option<&str>,
    ) -> Result<(), DbError> {
        let agent = agent.to_string();
        let event_type = event_type.to_string();
        let from_level = from_level.to_string();
        let to_level = to_level.to_string();
        let note = note.map(|s| s.to_string());
        let ts = now_ms();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO trust_events
                 (agent, event_type, from_level, to_level, consecutive_success, note, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    agent,
                    event_type,
                    from_level,
                    to_level,
                    consecutive_success,
                    note,
                    ts as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Most recent transitions for an agent, newest first.
    pub async fn trust_events_for(&self, agent: &str, limit: usize) -> Result<Vec<TrustEvent>, DbError> {
        let agent = agent.to_string();
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, agent, event_type, from_level, to_level, consecutive_success, note, timestamp
                 FROM trust_events WHERE agent = {} ORDER BY timestamp DESC LIMIT {}",
                quote(&agent),
                limit,
            ))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TrustEvent {
                        id: Some(row.get(0)?),
                        agent: row.get(1)?,
                        event_type: row.get(2)?,
                        from_level: row.get(3)?,
                        to_level: row.get(4)?,
                        consecutive_success: row.get(5)?,
                        note: row.get(6)?,
                        timestamp: row.get::<_, i64>(7)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Delete trust event rows older than `cutoff_ms` (spec §6 retention).
    pub async fn trust_event_purge_before(&self, cutoff_ms: u64) -> Result<usize, DbError> {
        self.exec(move |conn| {
            let n = conn.execute("DELETE FROM trust_events WHERE timestamp < ?1", rusqlite::params![cutoff_ms as i64])?;
            Ok(n)
        })
        .await
    }

    /// Count consecutive successes for an agent by scanning history newest-first
    /// until the first non-success row. Backs [`crate::trust::TrustRegistry::promotion_readiness`].
    pub async fn history_consecutive_successes(&self, agent: &str) -> Result<u32, DbError> {
        let agent = agent.to_string();
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT status FROM history WHERE agent = {} ORDER BY started_at DESC",
                quote(&agent),
            ))?;
            let statuses = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut count = 0u32;
            for status in statuses {
                if status == "success" {
                    count += 1;
                } else {
                    break;
                }
            }
            Ok(count)
        })
        .await
    }
}
