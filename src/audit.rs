//! Batched audit writer (C2). `log()` never blocks the caller: it places an
//! entry on a bounded channel and returns. A single background consumer
//! drains the channel, batching flushes into one joined multi-statement
//! INSERT via the store gateway.

use crate::db::{now_ms, quote, Db};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

const QUEUE_CAPACITY: usize = 256;
const FLUSH_BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const MAX_DETAIL_CHARS: usize = 500;

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

struct PendingEntry {
    timestamp: u64,
    action: String,
    source: String,
    detail: Option<String>,
    client_ip: Option<String>,
}

/// Handle callers use to enqueue audit events. Cloning is cheap — it's a
/// sender handle onto the one background consumer.
#[derive(Clone)]
pub struct AuditWriter {
    tx: mpsc::Sender<PendingEntry>,
}

impl AuditWriter {
    /// Spawn the background consumer and return a handle to it.
    pub fn spawn(db: Db) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(consumer_loop(db, rx));
        Self { tx }
    }

    /// Non-blocking log call. If the queue is full the entry is dropped and
    /// a structured warning is emitted — the caller never learns this
    /// happened.
    pub fn log(&self, action: &str, source: &str, detail: Option<&str>, client_ip: Option<&str>) {
        let entry = PendingEntry {
            timestamp: now_ms(),
            action: action.to_string(),
            source: source.to_string(),
            detail: detail.map(|s| truncate_chars(s, MAX_DETAIL_CHARS)),
            client_ip: client_ip.map(|s| s.to_string()),
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(entry) {
            tracing::warn!(action, "audit log queue full");
        }
    }
}

async fn consumer_loop(db: Db, mut rx: mpsc::Receiver<PendingEntry>) {
    let mut buf: Vec<PendingEntry> = Vec::with_capacity(FLUSH_BATCH_SIZE);
    loop {
        if buf.is_empty() {
            match rx.recv().await {
                Some(entry) => buf.push(entry),
                None => break,
            }
        } else {
            let deadline = Instant::now() + FLUSH_INTERVAL;
            tokio::select! {
                maybe_entry = rx.recv() => match maybe_entry {
                    Some(entry) => buf.push(entry),
                    None => {
                        flush(&db, &mut buf).await;
                        break;
                    }
                },
                _ = sleep_until(deadline) => {
                    flush(&db, &mut buf).await;
                    continue;
                }
            }
        }
        if buf.len() >= FLUSH_BATCH_SIZE {
            flush(&db, &mut buf).await;
        }
    }
    if !buf.is_empty() {
        flush(&db, &mut buf).await;
    }
}

async fn flush(db: &Db, buf: &mut Vec<PendingEntry>) {
    if buf.is_empty() {
        return;
    }
    let batch_size = buf.len();
    let statements: Vec<String> = buf
        .drain(..)
        .map(|e| {
            format!(
                "INSERT INTO audit_log (timestamp, action, source, detail, client_ip) VALUES ({}, {}, {}, {}, {})",
                e.timestamp,
                quote(&e.action),
                quote(&e.source),
                e.detail.as_deref().map(quote).unwrap_or_else(|| "NULL".to_string()),
                e.client_ip.as_deref().map(quote).unwrap_or_else(|| "NULL".to_string()),
            )
        })
        .collect();
    let sql = statements.join(";\n") + ";";
    if let Err(err) = db.exec_batch(sql).await {
        tracing::error!(batch_size, %err, "audit batch flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_batches_flush_on_size() {
        let db = Db::open_memory().unwrap();
        let writer = AuditWriter::spawn(db.clone());
        for i in 0..120 {
            writer.log("tick", &format!("src-{i}"), None, None);
        }
        // Give the consumer a chance to drain and flush the >=50-sized batches.
        sleep(Duration::from_millis(200)).await;
        let rows = db.audit_query(1000).await.unwrap();
        assert_eq!(rows.len(), 120);
    }

    #[tokio::test]
    async fn test_flushes_on_interval_even_below_batch_size() {
        let db = Db::open_memory().unwrap();
        let writer = AuditWriter::spawn(db.clone());
        writer.log("single", "src", Some("detail"), Some("127.0.0.1"));
        sleep(FLUSH_INTERVAL + Duration::from_millis(200)).await;
        let rows = db.audit_query(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "single");
    }

    #[tokio::test]
    async fn test_detail_truncated_to_max_chars() {
        let db = Db::open_memory().unwrap();
        let writer = AuditWriter::spawn(db.clone());
        let long = "x".repeat(2000);
        writer.log("big", "src", Some(&long), None);
        sleep(FLUSH_INTERVAL + Duration::from_millis(200)).await;
        let rows = db.audit_query(10).await.unwrap();
        assert_eq!(rows[0].detail.as_ref().unwrap().chars().count(), MAX_DETAIL_CHARS);
    }

    #[tokio::test]
    async fn test_quote_escaping_in_batch() {
        let db = Db::open_memory().unwrap();
        let writer = AuditWriter::spawn(db.clone());
        writer.log("it's a test", "o'brien", None, None);
        sleep(FLUSH_INTERVAL + Duration::from_millis(200)).await;
        let rows = db.audit_query(10).await.unwrap();
        assert_eq!(rows[0].action, "it's a test");
        assert_eq!(rows[0].source, "o'brien");
    }
}
