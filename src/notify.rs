//! Notification fan-out (C12): delivers text to every configured outbound
//! channel, swallowing individual channel failures (a notification is
//! best-effort — it must never fail the job/reminder/task that triggered
//! it), and applies a quiet-hours policy before delivery.

use crate::channels::{ChannelAdapter, OutgoingMessage};
use async_trait::async_trait;
use chrono::{Local, NaiveTime, Timelike};
use std::sync::{Arc, Mutex};

/// One outbound delivery channel (Telegram/Discord/Slack/webhook/...).
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

/// Bridges a [`ChannelAdapter`] (which speaks in [`OutgoingMessage`]s
/// addressed to a session) into an [`OutboundChannel`] (which just takes
/// text) by fixing the destination session up front. Lets cron/board/
/// reminders deliver through the same Telegram/Discord/Slack adapters the
/// conversational loop uses, without those subsystems knowing about
/// sessions at all.
pub struct ChannelOutbound {
    adapter: Arc<dyn ChannelAdapter>,
    session_id: String,
}

impl ChannelOutbound {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, session_id: String) -> Self {
        Self { adapter, session_id }
    }
}

#[async_trait]
impl OutboundChannel for ChannelOutbound {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        self.adapter
            .send(OutgoingMessage {
                channel: self.adapter.name().to_string(),
                session_id: self.session_id.clone(),
                content: text.to_string(),
                reply_to: None,
            })
            .await
    }

    fn name(&self) -> &str {
        self.adapter.name()
    }
}

/// What callers (cron, reminders, board, dispatch) depend on — hides the
/// fan-out and quiet-hours mechanics behind one `send`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);
}

#[derive(Debug, Clone, Copy)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    /// Whether `now` falls inside the quiet window. Handles windows that
    /// wrap past midnight (`start > end`).
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            now >= self.start && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }
}

/// Fans a notification out to every configured channel. During quiet hours
/// messages are buffered into a digest and flushed as one combined message
/// once the window ends.
pub struct MultiNotifier {
    channels: Vec<Box<dyn OutboundChannel>>,
    quiet_hours: Option<QuietHours>,
    digest: Mutex<Vec<String>>,
    in_quiet_window: Mutex<bool>,
}

impl MultiNotifier {
    pub fn new(channels: Vec<Box<dyn OutboundChannel>>, quiet_hours: Option<QuietHours>) -> Self {
        Self {
            channels,
            quiet_hours,
            digest: Mutex::new(Vec::new()),
            in_quiet_window: Mutex::new(false),
        }
    }

    async fn deliver_now(&self, text: &str) {
        for channel in &self.channels {
            if let Err(err) = channel.send(text).await {
                tracing::warn!(channel = channel.name(), %err, "notification delivery failed");
            }
        }
    }

    /// Check whether quiet hours just ended and, if so, flush the digest as
    /// one combined message. Called on every `send` so the transition is
    /// detected without a dedicated timer.
    async fn maybe_flush_digest(&self, now_in_quiet: bool) {
        let mut was_in_quiet = self.in_quiet_window.lock().unwrap();
        if *was_in_quiet && !now_in_quiet {
            let pending: Vec<String> = std::mem::take(&mut *self.digest.lock().unwrap());
            if !pending.is_empty() {
                let combined = pending.join("\n---\n");
                drop(was_in_quiet);
                self.deliver_now(&combined).await;
                return;
            }
        }
        *was_in_quiet = now_in_quiet;
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    async fn send(&self, text: &str) {
        let now = Local::now().time().with_nanosecond(0).unwrap_or_else(|| Local::now().time());
        let in_quiet = self.quiet_hours.is_some_and(|q| q.contains(now));
        self.maybe_flush_digest(in_quiet).await;

        if in_quiet {
            self.digest.lock().unwrap().push(text.to_string());
            *self.in_quiet_window.lock().unwrap() = true;
            return;
        }

        self.deliver_now(text).await;
    }
}
