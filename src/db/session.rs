use super::{now_ms, quote, Db, DbError};

/// Per-(channel, agent) conversation continuum (C4).
#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub channel: String,
    pub channel_key: String,
    pub agent: Option<String>,
    pub title: Option<String>,
    pub active: bool,
    pub cost_usd: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub message_count: i64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// One message belonging to a session.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub id: i64,
    pub session_id: i64,
    pub role: String,
    pub content: String,
    pub cost_usd: Option<f64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub model: Option<String>,
    pub task_id: Option<String>,
    pub timestamp: u64,
}

const MAX_MESSAGE_CONTENT_CHARS: usize = 5000;

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        channel: row.get(1)?,
        channel_key: row.get(2)?,
        agent: row.get(3)?,
        title: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        cost_usd: row.get(6)?,
        tokens_in: row.get(7)?,
        tokens_out: row.get(8)?,
        message_count: row.get(9)?,
        created_at: row.get::<_, i64>(10)? as u64,
        updated_at: row.get::<_, i64>(11)? as u64,
    })
}

const SESSION_COLS: &str =
    "id, channel, channel_key, agent, title, active, cost_usd, tokens_in, tokens_out, message_count, created_at, updated_at";

impl Db {
    /// Returns the single active session for `(channel, channel_key)`, creating
    /// one if none exists or the prior one was archived.
    pub async fn session_get_or_create(
        &self,
        channel: &str,
        channel_key: &str,
        agent: Option<&str>,
        title: Option<&str>,
    ) -> Result<Session, DbError> {
        let channel = channel.to_string();
        let channel_key = channel_key.to_string();
        let agent = agent.map(|s| s.to_string());
        let title = title.map(|s| s.to_string());
        self.exec(move |conn| {
            let existing = conn
                .query_row(
                    &format!(
                        "SELECT {SESSION_COLS} FROM sessions
                         WHERE channel = {} AND channel_key = {} AND active = 1",
                        quote(&channel),
                        quote(&channel_key),
                    ),
                    [],
                    row_to_session,
                )
                .ok();
            if let Some(session) = existing {
                return Ok(session);
            }
            let ts = now_ms();
            conn.execute(
                "INSERT INTO sessions
                 (channel, channel_key, agent, title, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                rusqlite::params![channel, channel_key, agent, title, ts as i64],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = {id}"),
                [],
                row_to_session,
            )
            .map_err(Into::into)
        })
        .await
    }

    /// Append a message, truncating content to the ingress bound, and bump
    /// the session's running stats.
    pub async fn session_add_message(
        &self,
        session_id: i64,
        role: &str,
        content: &str,
        cost_usd: Option<f64>,
        tokens_in: Option<i64>,
        tokens_out: Option<i64>,
        model: Option<&str>,
        task_id: Option<&str>,
    ) -> Result<(), DbError> {
        let role = role.to_string();
        let content = truncate_chars(content, MAX_MESSAGE_CONTENT_CHARS);
        let model = model.map(|s| s.to_string());
        let task_id = task_id.map(|s| s.to_string());
        let ts = now_ms();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO session_messages
                 (session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, ts as i64,
                ],
            )?;
            conn.execute(
                "UPDATE sessions SET
                   cost_usd = cost_usd + ?1,
                   tokens_in = tokens_in + ?2,
                   tokens_out = tokens_out + ?3,
                   message_count = message_count + 1,
                   updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    cost_usd.unwrap_or(0.0),
                    tokens_in.unwrap_or(0),
                    tokens_out.unwrap_or(0),
                    ts as i64,
                    session_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Last `max_messages` non-system messages, chronological order.
    pub async fn session_build_context(
        &self,
        session_id: i64,
        max_messages: usize,
    ) -> Result<String, DbError> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content FROM session_messages
                 WHERE session_id = ?1 AND role != 'system'
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let mut rows: Vec<(String, String)> = stmt
                .query_map(rusqlite::params![session_id, max_messages as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            let lines: Vec<String> = rows
                .into_iter()
                .map(|(role, content)| format!("{role}: {content}"))
                .collect();
            Ok(lines.join("\n"))
        })
        .await
    }

    /// Mark the current active session for a key archived; subsequent
    /// `session_get_or_create` calls allocate a fresh session.
    pub async fn session_archive(&self, channel: &str, channel_key: &str) -> Result<(), DbError> {
        let channel = channel.to_string();
        let channel_key = channel_key.to_string();
        self.exec(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE sessions SET active = 0 WHERE channel = {} AND channel_key = {} AND active = 1",
                    quote(&channel),
                    quote(&channel_key),
                ),
                [],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete inactive sessions last touched before `cutoff_ms`, plus their
    /// messages (spec §6 retention / `data cleanup`). Active sessions are
    /// never purged regardless of age.
    pub async fn session_purge_before(&self, cutoff_ms: u64) -> Result<usize, DbError> {
        self.exec(move |conn| {
            let ids: Vec<i64> = conn
                .prepare("SELECT id FROM sessions WHERE active = 0 AND updated_at < ?1")?
                .query_map(rusqlite::params![cutoff_ms as i64], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            for id in &ids {
                conn.execute("DELETE FROM session_messages WHERE session_id = ?1", rusqlite::params![id])?;
            }
            let n = conn.execute("DELETE FROM sessions WHERE active = 0 AND updated_at < ?1", rusqlite::params![cutoff_ms as i64])?;
            Ok(n)
        })
        .await
    }

    pub async fn session_message_count(&self, session_id: i64) -> Result<i64, DbError> {
        self.exec(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM session_messages WHERE session_id = ?1",
                rusqlite::params![session_id],
                |r| r.get(0),
            )?;
            Ok(n)
        })
        .await
    }

    /// Active sessions, most recently updated first. Backs the web dashboard's
    /// read-only session list.
    pub async fn session_list_active(&self, limit: usize) -> Result<Vec<Session>, DbError> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLS} FROM sessions WHERE active = 1 ORDER BY updated_at DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![limit as i64], row_to_session)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Messages beyond the most recent `keep_recent`, oldest first. Empty
    /// when the session hasn't grown past the high-water mark yet. Backs
    /// [`crate::runner::TaskRunner::maybe_compact_session`].
    pub async fn session_oldest_messages_for_compaction(&self, session_id: i64, keep_recent: i64) -> Result<Vec<SessionMessage>, DbError> {
        self.exec(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM session_messages WHERE session_id = ?1",
                rusqlite::params![session_id],
                |r| r.get(0),
            )?;
            let excess = total - keep_recent;
            if excess <= 0 {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, timestamp
                 FROM session_messages WHERE session_id = ?1 ORDER BY timestamp ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![session_id, excess], |row| {
                    Ok(SessionMessage {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        role: row.get(2)?,
                        content: row.get(3)?,
                        cost_usd: row.get(4)?,
                        tokens_in: row.get(5)?,
                        tokens_out: row.get(6)?,
                        model: row.get(7)?,
                        task_id: row.get(8)?,
                        timestamp: row.get::<_, i64>(9)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Delete `message_ids` and insert one synthetic `system`-role summary
    /// message in their place, adjusting `message_count` accordingly.
    pub async fn session_replace_with_summary(&self, session_id: i64, message_ids: &[i64], summary: &str) -> Result<(), DbError> {
        let ids = message_ids.to_vec();
        let summary = truncate_chars(summary, MAX_MESSAGE_CONTENT_CHARS);
        let ts = now_ms();
        self.exec(move |conn| {
            let removed = ids.len() as i64;
            for id in &ids {
                conn.execute("DELETE FROM session_messages WHERE id = ?1 AND session_id = ?2", rusqlite::params![id, session_id])?;
            }
            conn.execute(
                "INSERT INTO session_messages (session_id, role, content, timestamp) VALUES (?1, 'system', ?2, ?3)",
                rusqlite::params![session_id, format!("[summary] {summary}"), ts as i64],
            )?;
            conn.execute(
                "UPDATE sessions SET message_count = message_count - ?1 + 1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![removed, ts as i64, session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn session_messages(&self, session_id: i64, limit: usize) -> Result<Vec<SessionMessage>, DbError> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, timestamp
                 FROM session_messages WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let mut rows: Vec<SessionMessage> = stmt
                .query_map(rusqlite::params![session_id, limit as i64], |row| {
                    Ok(SessionMessage {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        role: row.get(2)?,
                        content: row.get(3)?,
                        cost_usd: row.get(4)?,
                        tokens_in: row.get(5)?,
                        tokens_out: row.get(6)?,
                        model: row.get(7)?,
                        task_id: row.get(8)?,
                        timestamp: row.get::<_, i64>(9)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }
}

/// Prepend context as a boxed prelude. Idempotent and human-readable; when
/// context is empty the prompt is returned unchanged.
pub fn wrap_with_context(context: &str, current_prompt: &str) -> String {
    if context.is_empty() {
        return current_prompt.to_string();
    }
    format!(
        "--- conversation context ---\n{context}\n--- end context ---\n\n{current_prompt}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let db = Db::open_memory().unwrap();
        let s1 = db
            .session_get_or_create("telegram", "telegram:writer", Some("writer"), None)
            .await
            .unwrap();
        let s2 = db
            .session_get_or_create("telegram", "telegram:writer", Some("writer"), None)
            .await
            .unwrap();
        assert_eq!(s1.id, s2.id);
    }

    #[tokio::test]
    async fn test_archive_creates_new_session() {
        let db = Db::open_memory().unwrap();
        let s1 = db
            .session_get_or_create("telegram", "telegram:ask", None, None)
            .await
            .unwrap();
        db.session_archive("telegram", "telegram:ask").await.unwrap();
        let s2 = db
            .session_get_or_create("telegram", "telegram:ask", None, None)
            .await
            .unwrap();
        assert_ne!(s1.id, s2.id);
    }

    #[tokio::test]
    async fn test_add_message_updates_stats() {
        let db = Db::open_memory().unwrap();
        let s = db
            .session_get_or_create("cli", "cli:ask", None, None)
            .await
            .unwrap();
        db.session_add_message(s.id, "user", "hello", None, None, None, None, None)
            .await
            .unwrap();
        db.session_add_message(
            s.id,
            "assistant",
            "hi there",
            Some(0.01),
            Some(10),
            Some(20),
            Some("gpt-5"),
            Some("task-1"),
        )
        .await
        .unwrap();

        let n = db.session_message_count(s.id).await.unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_context_bounds_last_n_chronological() {
        let db = Db::open_memory().unwrap();
        let s = db
            .session_get_or_create("cli", "cli:ask", None, None)
            .await
            .unwrap();
        for i in 0..100 {
            db.session_add_message(s.id, "user", &format!("msg-{i}"), None, None, None, None, None)
                .await
                .unwrap();
        }
        let context = db.session_build_context(s.id, 20).await.unwrap();
        let lines: Vec<&str> = context.lines().collect();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[0], "user: msg-80");
        assert_eq!(lines[19], "user: msg-99");
    }

    #[test]
    fn test_wrap_with_context_empty_is_identity() {
        assert_eq!(wrap_with_context("", "hello"), "hello");
    }

    #[test]
    fn test_wrap_with_context_prepends() {
        let wrapped = wrap_with_context("user: hi", "what now?");
        assert!(wrapped.contains("user: hi"));
        assert!(wrapped.ends_with("what now?"));
    }

    #[tokio::test]
    async fn test_purge_before_skips_active_sessions() {
        let db = Db::open_memory().unwrap();
        let active = db.session_get_or_create("cli", "cli:keep", None, None).await.unwrap();
        let archived = db.session_get_or_create("cli", "cli:drop", None, None).await.unwrap();
        db.session_archive("cli", "cli:drop").await.unwrap();
        db.exec_sync(|conn| {
            conn.execute("UPDATE sessions SET updated_at = 0", [])?;
            Ok(())
        })
        .unwrap();
        let purged = db.session_purge_before(now_ms()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(db.session_messages(archived.id, 10).await.unwrap().is_empty());
        assert!(db.session_get_or_create("cli", "cli:keep", None, None).await.unwrap().id == active.id);
    }

    #[tokio::test]
    async fn test_compaction_replaces_oldest_with_summary() {
        let db = Db::open_memory().unwrap();
        let s = db.session_get_or_create("cli", "cli:ask", None, None).await.unwrap();
        for i in 0..10 {
            db.session_add_message(s.id, "user", &format!("msg-{i}"), None, None, None, None, None).await.unwrap();
        }
        let stale = db.session_oldest_messages_for_compaction(s.id, 5).await.unwrap();
        assert_eq!(stale.len(), 5);
        assert_eq!(stale[0].content, "msg-0");

        let ids: Vec<i64> = stale.iter().map(|m| m.id).collect();
        db.session_replace_with_summary(s.id, &ids, "earlier discussion").await.unwrap();

        let remaining = db.session_messages(s.id, 100).await.unwrap();
        assert_eq!(remaining.len(), 6);
        assert_eq!(remaining[0].role, "system");
        assert!(remaining[0].content.contains("earlier discussion"));
        assert_eq!(db.session_message_count(s.id).await.unwrap(), 6);
    }

    #[test]
    fn test_truncate_chars_respects_content_bound() {
        let long = "a".repeat(6000);
        let truncated = truncate_chars(&long, MAX_MESSAGE_CONTENT_CHARS);
        assert_eq!(truncated.chars().count(), MAX_MESSAGE_CONTENT_CHARS);
    }
}
