pub mod audit;
pub mod board;
pub mod cron;
pub mod history;
pub mod memory;
pub mod reminders;
pub mod session;
pub mod trust;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Lock poisoned")]
    LockPoisoned,
    #[error("Join error: {0}")]
    JoinError(String),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Store gateway (C1). The single path every other component uses to reach
/// the relational store. Callers build SQL strings themselves and quote
/// values through [`quote`] — there are no prepared-statement builders here
/// by design: string-level transparency over ORM ergonomics.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open a file-backed database with WAL mode.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::configure_and_migrate(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::configure_and_migrate(conn)
    }

    fn configure_and_migrate(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Execute a blocking DB operation on a spawn_blocking thread. This is the
    /// `exec(sql)` / `query(sql) -> rows` boundary from spec C1: every caller
    /// above this line is async, everything below is plain rusqlite.
    pub async fn exec<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| DbError::LockPoisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| DbError::JoinError(e.to_string()))?
    }

    /// Execute a blocking DB operation synchronously (tick loops, tests).
    pub fn exec_sync<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&conn)
    }

    /// Run a batch of statements joined by `;\n` in one gateway call — used by
    /// the audit writer to flush a batch as a single insert.
    pub async fn exec_batch(&self, sql: String) -> Result<(), DbError> {
        self.exec(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    // -- Schema --
    //
    // Each subsystem owns its table's `CREATE TABLE IF NOT EXISTS`; schema
    // evolution is additive only (spec §6). Inlined here (rather than
    // `include_str!`'d migration files) since this crate has no migrations/
    // directory of its own.

    const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            action TEXT NOT NULL,
            source TEXT NOT NULL,
            detail TEXT,
            client_ip TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_audit_log_ts ON audit_log(timestamp);

        CREATE TABLE IF NOT EXISTS trust_events (
            id INTEGER PRIMARY KEY,
            agent TEXT NOT NULL,
            event_type TEXT NOT NULL,
            from_level TEXT NOT NULL,
            to_level TEXT NOT NULL,
            consecutive_success INTEGER NOT NULL,
            note TEXT,
            timestamp INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY,
            channel TEXT NOT NULL,
            channel_key TEXT NOT NULL,
            agent TEXT,
            title TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            cost_usd REAL NOT NULL DEFAULT 0,
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            message_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_key ON sessions(channel, channel_key, active);

        CREATE TABLE IF NOT EXISTS session_messages (
            id INTEGER PRIMARY KEY,
            session_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            cost_usd REAL,
            tokens_in INTEGER,
            tokens_out INTEGER,
            model TEXT,
            task_id TEXT,
            timestamp INTEGER NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        );
        CREATE INDEX IF NOT EXISTS idx_session_messages_sid ON session_messages(session_id, timestamp);

        CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY,
            task_id TEXT NOT NULL,
            name TEXT NOT NULL,
            source TEXT NOT NULL,
            agent TEXT NOT NULL,
            task_json TEXT NOT NULL,
            status TEXT NOT NULL,
            exit_code INTEGER,
            output TEXT,
            error TEXT,
            cost_usd REAL NOT NULL DEFAULT 0,
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            model_used TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            session_id TEXT,
            output_file TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_history_agent ON history(agent, started_at);
        CREATE INDEX IF NOT EXISTS idx_history_started ON history(started_at);

        CREATE TABLE IF NOT EXISTS cron_jobs (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            schedule TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            agent TEXT,
            task_template_json TEXT NOT NULL,
            notify INTEGER NOT NULL DEFAULT 1,
            max_retries INTEGER NOT NULL DEFAULT 0,
            retry_delay_secs INTEGER NOT NULL DEFAULT 30,
            on_success_json TEXT NOT NULL DEFAULT '[]',
            on_failure_json TEXT NOT NULL DEFAULT '[]',
            requires_approval INTEGER NOT NULL DEFAULT 0,
            approval_timeout_secs INTEGER NOT NULL DEFAULT 600,
            next_run INTEGER,
            last_run INTEGER,
            last_error TEXT,
            consecutive_errors INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS board_tasks (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'backlog',
            assignee TEXT,
            project TEXT,
            model_override TEXT,
            cost_usd REAL,
            duration_ms INTEGER,
            session_id TEXT,
            comment TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_board_tasks_status ON board_tasks(status, assignee);

        CREATE TABLE IF NOT EXISTS reminders (
            id INTEGER PRIMARY KEY,
            text TEXT NOT NULL,
            due_at INTEGER NOT NULL,
            recurring TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            channel TEXT NOT NULL,
            user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders(status, due_at);
        CREATE INDEX IF NOT EXISTS idx_reminders_user ON reminders(user_id, status);

        CREATE TABLE IF NOT EXISTS memory (
            id INTEGER PRIMARY KEY,
            key TEXT,
            content TEXT NOT NULL,
            tags TEXT,
            source TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS handoffs (
            id INTEGER PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            step_name TEXT NOT NULL,
            output TEXT NOT NULL,
            instruction TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agent_messages (
            id INTEGER PRIMARY KEY,
            from_agent TEXT NOT NULL,
            to_agent TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_runs (
            id INTEGER PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER
        );
    ";

    fn run_migrations(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        conn.execute_batch(Self::SCHEMA)?;
        Ok(())
    }
}

/// Escape a value for inclusion in a hand-built SQL string. Every caller-
/// supplied value MUST be routed through this before interpolation — direct
/// interpolation of unescaped values is banned by convention (spec C1).
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Current time in milliseconds since epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
