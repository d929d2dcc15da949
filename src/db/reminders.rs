use super::{now_ms, quote, Db, DbError};

/// A time-based reminder (C11). One-shot when `recurring` is empty, else a
/// cron expression the reminder re-parses on each fire.
#[derive(Debug, Clone)]
pub struct Reminder {
    pub id: i64,
    pub text: String,
    pub due_at: u64,
    pub recurring: String,
    pub status: String,
    pub channel: String,
    pub user_id: String,
    pub created_at: u64,
}

fn row_to_reminder(row: &rusqlite::Row) -> rusqlite::Result<Reminder> {
    Ok(Reminder {
        id: row.get(0)?,
        text: row.get(1)?,
        due_at: row.get::<_, i64>(2)? as u64,
        recurring: row.get(3)?,
        status: row.get(4)?,
        channel: row.get(5)?,
        user_id: row.get(6)?,
        created_at: row.get::<_, i64>(7)? as u64,
    })
}

const REMINDER_COLS: &str = "id, text, due_at, recurring, status, channel, user_id, created_at";

/// Per-user cap on simultaneously pending reminders.
pub const MAX_PENDING_PER_USER: i64 = 50;

impl Db {
    pub async fn reminder_count_pending(&self, user_id: &str) -> Result<i64, DbError> {
        let user_id = user_id.to_string();
        self.exec(move |conn| {
            let n: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM reminders WHERE user_id = {} AND status = 'pending'",
                    quote(&user_id),
                ),
                [],
                |r| r.get(0),
            )?;
            Ok(n)
        })
        .await
    }

    pub async fn reminder_add(
        &self,
        text: &str,
        due_at: u64,
        recurring: &str,
        channel: &str,
        user_id: &str,
    ) -> Result<i64, DbError> {
        let text = text.to_string();
        let recurring = recurring.to_string();
        let channel = channel.to_string();
        let user_id = user_id.to_string();
        let ts = now_ms();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO reminders (text, due_at, recurring, status, channel, user_id, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
                rusqlite::params![text, due_at as i64, recurring, channel, user_id, ts as i64],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Due, pending reminders, oldest-due first, capped at 100 per tick.
    pub async fn reminders_due(&self, now_ms_: u64) -> Result<Vec<Reminder>, DbError> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REMINDER_COLS} FROM reminders
                 WHERE status = 'pending' AND due_at <= {now_ms_}
                 ORDER BY due_at ASC LIMIT 100",
            ))?;
            let rows = stmt.query_map([], row_to_reminder)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn reminder_mark_fired(&self, id: i64) -> Result<(), DbError> {
        self.exec(move |conn| {
            conn.execute(
                "UPDATE reminders SET status = 'fired' WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(())
        })
        .await
    }

    /// Reschedule a recurring reminder's `due_at`, keeping status pending.
    pub async fn reminder_reschedule(&self, id: i64, new_due_at: u64) -> Result<(), DbError> {
        self.exec(move |conn| {
            conn.execute(
                "UPDATE reminders SET due_at = ?1 WHERE id = ?2",
                rusqlite::params![new_due_at as i64, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn reminder_cancel(&self, id: i64, user_id: &str) -> Result<bool, DbError> {
        let user_id = user_id.to_string();
        self.exec(move |conn| {
            let n = conn.execute(
                "UPDATE reminders SET status = 'cancelled' WHERE id = ?1 AND user_id = ?2 AND status = 'pending'",
                rusqlite::params![id, user_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn reminder_get(&self, id: i64) -> Result<Option<Reminder>, DbError> {
        self.exec(move |conn| {
            let result = conn.query_row(
                &format!("SELECT {REMINDER_COLS} FROM reminders WHERE id = {id}"),
                [],
                row_to_reminder,
            );
            match result {
                Ok(r) => Ok(Some(r)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn reminders_list_for(&self, user_id: &str) -> Result<Vec<Reminder>, DbError> {
        let user_id = user_id.to_string();
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REMINDER_COLS} FROM reminders
                 WHERE user_id = {} AND status = 'pending' ORDER BY due_at ASC",
                quote(&user_id),
            ))?;
            let rows = stmt.query_map([], row_to_reminder)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

/// Push a reminder's `due_at` forward by `delta_ms`, computed from "now" if
/// the stored due-at is already in the past — matches spec §4.11 snooze.
pub fn snooze_target(current_due_at: u64, delta_ms: u64, now: u64) -> u64 {
    if current_due_at < now {
        now + delta_ms
    } else {
        current_due_at + delta_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_due_scan() {
        let db = Db::open_memory().unwrap();
        let past = now_ms().saturating_sub(1000);
        let future = now_ms() + 1_000_000;
        db.reminder_add("take a break", past, "", "telegram", "u1").await.unwrap();
        db.reminder_add("future thing", future, "", "telegram", "u1").await.unwrap();

        let due = db.reminders_due(now_ms()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].text, "take a break");
    }

    #[tokio::test]
    async fn test_fire_and_reschedule() {
        let db = Db::open_memory().unwrap();
        let id = db
            .reminder_add("standup", now_ms(), "0 9 * * *", "slack", "u1")
            .await
            .unwrap();
        db.reminder_reschedule(id, now_ms() + 86_400_000).await.unwrap();
        let r = db.reminder_get(id).await.unwrap().unwrap();
        assert_eq!(r.status, "pending");
        assert!(r.due_at > now_ms());
    }

    #[tokio::test]
    async fn test_cancel_requires_ownership() {
        let db = Db::open_memory().unwrap();
        let id = db.reminder_add("x", now_ms(), "", "cli", "u1").await.unwrap();
        assert!(!db.reminder_cancel(id, "u2").await.unwrap());
        assert!(db.reminder_cancel(id, "u1").await.unwrap());
    }

    #[test]
    fn test_snooze_from_future_due() {
        let now = 1000;
        assert_eq!(snooze_target(2000, 500, now), 2500);
    }

    #[test]
    fn test_snooze_from_past_due_uses_now() {
        let now = 5000;
        assert_eq!(snooze_target(1000, 500, now), 5500);
    }
}
