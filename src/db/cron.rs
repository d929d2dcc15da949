use super::{now_ms, quote, Db, DbError};

/// Persisted shape of a scheduled job (C9). `task_template_json` holds the
/// prompt/model/agent template expanded at run time; `schedule` is a 5-field
/// cron expression validated by [`crate::cron::parser`] before it reaches
/// this table.
#[derive(Debug, Clone)]
pub struct CronJobRow {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub schedule: String,
    pub timezone: String,
    pub agent: Option<String>,
    pub task_template_json: String,
    pub notify: bool,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub on_success_json: String,
    pub on_failure_json: String,
    pub requires_approval: bool,
    pub approval_timeout_secs: u64,
    pub next_run: Option<u64>,
    pub last_run: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<CronJobRow> {
    Ok(CronJobRow {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        schedule: row.get(3)?,
        timezone: row.get(4)?,
        agent: row.get(5)?,
        task_template_json: row.get(6)?,
        notify: row.get::<_, i64>(7)? != 0,
        max_retries: row.get::<_, i64>(8)? as u32,
        retry_delay_secs: row.get::<_, i64>(9)? as u64,
        on_success_json: row.get(10)?,
        on_failure_json: row.get(11)?,
        requires_approval: row.get::<_, i64>(12)? != 0,
        approval_timeout_secs: row.get::<_, i64>(13)? as u64,
        next_run: row.get::<_, Option<i64>>(14)?.map(|v| v as u64),
        last_run: row.get::<_, Option<i64>>(15)?.map(|v| v as u64),
        last_error: row.get(16)?,
        consecutive_errors: row.get::<_, i64>(17)? as u32,
        created_at: row.get::<_, i64>(18)? as u64,
        updated_at: row.get::<_, i64>(19)? as u64,
    })
}

const CRON_COLS: &str = "id, name, enabled, schedule, timezone, agent, task_template_json, notify, \
     max_retries, retry_delay_secs, on_success_json, on_failure_json, requires_approval, \
     approval_timeout_secs, next_run, last_run, last_error, consecutive_errors, created_at, updated_at";

/// Jobs auto-disable after this many consecutive failures (spec global invariant).
pub const AUTO_DISABLE_AFTER: u32 = 3;

pub struct CronJobInsert<'a> {
    pub name: &'a str,
    pub schedule: &'a str,
    pub timezone: &'a str,
    pub agent: Option<&'a str>,
    pub task_template_json: &'a str,
    pub notify: bool,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub requires_approval: bool,
    pub approval_timeout_secs: u64,
    /// Job ids to trigger (at `depth + 1`) when this job succeeds.
    pub on_success: &'a [i64],
    /// Job ids to trigger (at `depth + 1`) when this job exhausts retries.
    pub on_failure: &'a [i64],
}

impl Db {
    pub async fn cron_job_create(&self, job: CronJobInsert<'_>) -> Result<i64, DbError> {
        let name = job.name.to_string();
        let schedule = job.schedule.to_string();
        let timezone = job.timezone.to_string();
        let agent = job.agent.map(|s| s.to_string());
        let task_template_json = job.task_template_json.to_string();
        let notify = job.notify;
        let max_retries = job.max_retries;
        let retry_delay_secs = job.retry_delay_secs;
        let requires_approval = job.requires_approval;
        let approval_timeout_secs = job.approval_timeout_secs;
        let on_success_json = serde_json::to_string(job.on_success).unwrap_or_else(|_| "[]".to_string());
        let on_failure_json = serde_json::to_string(job.on_failure).unwrap_or_else(|_| "[]".to_string());
        let ts = now_ms();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO cron_jobs
                 (name, enabled, schedule, timezone, agent, task_template_json, notify, max_retries,
                  retry_delay_secs, on_success_json, on_failure_json, requires_approval,
                  approval_timeout_secs, created_at, updated_at)
                 VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                rusqlite::params![
                    name,
                    schedule,
                    timezone,
                    agent,
                    task_template_json,
                    notify,
                    max_retries,
                    retry_delay_secs as i64,
                    on_success_json,
                    on_failure_json,
                    requires_approval,
                    approval_timeout_secs as i64,
                    ts as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn cron_job_get(&self, id: i64) -> Result<Option<CronJobRow>, DbError> {
        self.exec(move |conn| {
            match conn.query_row(&format!("SELECT {CRON_COLS} FROM cron_jobs WHERE id = {id}"), [], row_to_job) {
                Ok(j) => Ok(Some(j)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn cron_jobs_all(&self) -> Result<Vec<CronJobRow>, DbError> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {CRON_COLS} FROM cron_jobs ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_job)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn cron_job_set_enabled(&self, id: i64, enabled: bool) -> Result<(), DbError> {
        self.exec(move |conn| {
            conn.execute(
                "UPDATE cron_jobs SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![enabled, now_ms() as i64, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn cron_job_remove(&self, id: i64) -> Result<(), DbError> {
        self.exec(move |conn| {
            conn.execute("DELETE FROM cron_jobs WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
        .await
    }

    /// Record one completed run: `next_run`/`last_run`, and either reset or
    /// bump the consecutive-error counter, auto-disabling past the cap.
    pub async fn cron_job_record_run(&self, id: i64, next_run: Option<u64>, last_run: u64, success: bool, error: Option<&str>) -> Result<(), DbError> {
        let error = error.map(|s| s.to_string());
        self.exec(move |conn| {
            if success {
                conn.execute(
                    "UPDATE cron_jobs SET next_run = ?1, last_run = ?2, last_error = NULL,
                       consecutive_errors = 0, updated_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![next_run.map(|v| v as i64), last_run as i64, id],
                )?;
            } else {
                let consecutive: i64 = conn.query_row("SELECT consecutive_errors FROM cron_jobs WHERE id = ?1", rusqlite::params![id], |r| r.get(0))?;
                let new_count = consecutive + 1;
                let disable = new_count >= AUTO_DISABLE_AFTER as i64;
                conn.execute(
                    &format!(
                        "UPDATE cron_jobs SET next_run = ?1, last_run = ?2, last_error = {},
                           consecutive_errors = ?3, updated_at = ?2{}
                         WHERE id = ?4",
                        error.as_deref().map(quote).unwrap_or_else(|| "NULL".to_string()),
                        if disable { ", enabled = 0" } else { "" },
                    ),
                    rusqlite::params![next_run.map(|v| v as i64), last_run as i64, new_count, id],
                )?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CronJobInsert<'static> {
        CronJobInsert {
            name: "daily-report",
            schedule: "30 3 * * *",
            timezone: "UTC",
            agent: Some("writer"),
            task_template_json: "{}",
            notify: true,
            max_retries: 0,
            retry_delay_secs: 30,
            requires_approval: false,
            approval_timeout_secs: 600,
            on_success: &[],
            on_failure: &[],
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = Db::open_memory().unwrap();
        let id = db.cron_job_create(sample()).await.unwrap();
        let job = db.cron_job_get(id).await.unwrap().unwrap();
        assert_eq!(job.name, "daily-report");
        assert!(job.enabled);
        assert_eq!(job.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_on_success_and_on_failure_persisted() {
        let db = Db::open_memory().unwrap();
        let mut insert = sample();
        insert.on_success = &[10, 11];
        insert.on_failure = &[12];
        let id = db.cron_job_create(insert).await.unwrap();
        let job = db.cron_job_get(id).await.unwrap().unwrap();
        assert_eq!(job.on_success_json, "[10,11]");
        assert_eq!(job.on_failure_json, "[12]");
    }

    #[tokio::test]
    async fn test_record_run_success_resets_errors() {
        let db = Db::open_memory().unwrap();
        let id = db.cron_job_create(sample()).await.unwrap();
        db.cron_job_record_run(id, None, now_ms(), false, Some("boom")).await.unwrap();
        db.cron_job_record_run(id, Some(now_ms() + 60_000), now_ms(), true, None).await.unwrap();
        let job = db.cron_job_get(id).await.unwrap().unwrap();
        assert_eq!(job.consecutive_errors, 0);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_auto_disable_after_three_consecutive_failures() {
        let db = Db::open_memory().unwrap();
        let id = db.cron_job_create(sample()).await.unwrap();
        for _ in 0..3 {
            db.cron_job_record_run(id, None, now_ms(), false, Some("err")).await.unwrap();
        }
        let job = db.cron_job_get(id).await.unwrap().unwrap();
        assert_eq!(job.consecutive_errors, 3);
        assert!(!job.enabled);
    }

    #[tokio::test]
    async fn test_set_enabled_and_remove() {
        let db = Db::open_memory().unwrap();
        let id = db.cron_job_create(sample()).await.unwrap();
        db.cron_job_set_enabled(id, false).await.unwrap();
        assert!(!db.cron_job_get(id).await.unwrap().unwrap().enabled);
        db.cron_job_remove(id).await.unwrap();
        assert!(db.cron_job_get(id).await.unwrap().is_none());
    }
}
