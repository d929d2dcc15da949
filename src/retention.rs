//! Retention policy (ambient stack): per-table day-count cutoffs plus a
//! PII-pattern list applied to freeform text tables during cleanup.

use crate::db::{now_ms, Db, DbError};
use regex::Regex;
use serde::{Deserialize, Serialize};

const MS_PER_DAY: u64 = 86_400_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_history_days")]
    pub history: u32,
    #[serde(default = "default_sessions_days")]
    pub sessions: u32,
    #[serde(default = "default_audit_log_days")]
    pub audit_log: u32,
    #[serde(default = "default_trust_events_days")]
    pub trust_events: u32,
    #[serde(default)]
    pub pii_patterns: Vec<String>,
}

fn default_history_days() -> u32 {
    90
}
fn default_sessions_days() -> u32 {
    30
}
fn default_audit_log_days() -> u32 {
    180
}
fn default_trust_events_days() -> u32 {
    365
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            history: default_history_days(),
            sessions: default_sessions_days(),
            audit_log: default_audit_log_days(),
            trust_events: default_trust_events_days(),
            pii_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupReport {
    pub history_purged: usize,
    pub audit_log_purged: usize,
    pub sessions_purged: usize,
    pub trust_events_purged: usize,
}

/// Run one cleanup pass against `policy`, deleting rows older than their
/// configured cutoff.
pub async fn run_cleanup(db: &Db, policy: &RetentionPolicy) -> Result<CleanupReport, DbError> {
    let now = now_ms();
    let history_cutoff = now.saturating_sub(policy.history as u64 * MS_PER_DAY);
    let audit_cutoff = now.saturating_sub(policy.audit_log as u64 * MS_PER_DAY);
    let sessions_cutoff = now.saturating_sub(policy.sessions as u64 * MS_PER_DAY);
    let trust_events_cutoff = now.saturating_sub(policy.trust_events as u64 * MS_PER_DAY);

    let history_purged = db.history_purge_before(history_cutoff).await?;
    let audit_log_purged = db.audit_purge_before(audit_cutoff).await?;
    let sessions_purged = db.session_purge_before(sessions_cutoff).await?;
    let trust_events_purged = db.trust_event_purge_before(trust_events_cutoff).await?;

    Ok(CleanupReport {
        history_purged,
        audit_log_purged,
        sessions_purged,
        trust_events_purged,
    })
}

/// Redact any configured PII pattern in `text`, replacing matches with `[redacted]`.
pub fn redact_pii(text: &str, policy: &RetentionPolicy) -> String {
    let mut out = text.to_string();
    for pattern in &policy.pii_patterns {
        if let Ok(re) = Regex::new(pattern) {
            out = re.replace_all(&out, "[redacted]").into_owned();
        }
    }
    out
}
