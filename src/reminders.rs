//! Reminder engine (C11): ticks on a fixed interval, fires due reminders
//! through the configured notifier, and reschedules recurring ones via the
//! cron parser. Add/cancel/list/snooze are the CLI/channel-facing surface.

use crate::cron::parser::CronExpr;
use crate::db::reminders::{snooze_target, Reminder, MAX_PENDING_PER_USER};
use crate::db::{now_ms, Db, DbError};
use crate::notify::Notifier;
use crate::time_parse::{parse_relative_to, TimeParseError};
use chrono::Local;
use chrono_tz::UTC;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ReminderError {
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("could not understand the time: {0}")]
    Time(#[from] TimeParseError),
    #[error("too many pending reminders (max {MAX_PENDING_PER_USER})")]
    TooManyPending,
    #[error("reminder not found or not owned by this user")]
    NotFoundOrNotOwned,
}

pub struct ReminderEngine {
    db: Db,
    notifier: Arc<dyn Notifier>,
    check_interval: Duration,
}

impl ReminderEngine {
    pub fn new(db: Db, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            db,
            notifier,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.check_interval) => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    pub async fn tick(&self) {
        let due = match self.db.reminders_due(now_ms()).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(%err, "reminder tick: failed to list due reminders");
                return;
            }
        };
        for reminder in due {
            self.fire(reminder).await;
        }
    }

    async fn fire(&self, reminder: Reminder) {
        self.notifier.send(&format!("⏰ {}", reminder.text)).await;

        if reminder.recurring.is_empty() {
            if let Err(err) = self.db.reminder_mark_fired(reminder.id).await {
                tracing::error!(%err, id = reminder.id, "reminder: failed to mark fired");
            }
            return;
        }

        match CronExpr::parse(&reminder.recurring) {
            Ok(expr) => {
                let now = chrono::Utc::now().with_timezone(&UTC);
                match expr.next_run_after(&now) {
                    Some(next) => {
                        let next_ms = next.timestamp_millis() as u64;
                        if let Err(err) = self.db.reminder_reschedule(reminder.id, next_ms).await {
                            tracing::error!(%err, id = reminder.id, "reminder: failed to reschedule");
                        }
                    }
                    None => {
                        let _ = self.db.reminder_mark_fired(reminder.id).await;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(id = reminder.id, %err, "reminder: unparsable recurrence, firing once");
                let _ = self.db.reminder_mark_fired(reminder.id).await;
            }
        }
    }

    /// Add a reminder from a natural-language time expression, enforcing the
    /// per-user pending cap.
    pub async fn add(&self, text: &str, when: &str, recurring: &str, channel: &str, user_id: &str) -> Result<i64, ReminderError> {
        if self.db.reminder_count_pending(user_id).await? >= MAX_PENDING_PER_USER {
            return Err(ReminderError::TooManyPending);
        }
        let due = parse_relative_to(when, Local::now())?;
        let due_ms = due.timestamp_millis() as u64;
        Ok(self.db.reminder_add(text, due_ms, recurring, channel, user_id).await?)
    }

    pub async fn cancel(&self, id: i64, user_id: &str) -> Result<(), ReminderError> {
        if self.db.reminder_cancel(id, user_id).await? {
            Ok(())
        } else {
            Err(ReminderError::NotFoundOrNotOwned)
        }
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Reminder>, ReminderError> {
        Ok(self.db.reminders_list_for(user_id).await?)
    }

    /// Push a reminder's due time forward by `delta_ms`, scoped to the owner.
    pub async fn snooze(&self, id: i64, user_id: &str, delta_ms: u64) -> Result<(), ReminderError> {
        let reminder = self.db.reminder_get(id).await?.ok_or(ReminderError::NotFoundOrNotOwned)?;
        if reminder.user_id != user_id {
            return Err(ReminderError::NotFoundOrNotOwned);
        }
        let new_due = snooze_target(reminder.due_at, delta_ms, now_ms());
        self.db.reminder_reschedule(id, new_due).await?;
        Ok(())
    }
}
