use super::{split_message, ChannelAdapter, IncomingMessage, OutgoingMessage};
use crate::config::DiscordConfig;
use crate::db::now_ms;
use async_trait::async_trait;
use serenity::all::{ChannelId, Context, CreateMessage, EventHandler, GatewayIntents, Message, Ready};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Discord channel adapter using serenity.
pub struct DiscordAdapter {
    config: DiscordConfig,
    http: Arc<RwLock<Option<Arc<serenity::http::Http>>>>,
}

impl DiscordAdapter {
    pub fn new(config: DiscordConfig) -> Self {
        Self { config, http: Arc::new(RwLock::new(None)) }
    }
}

struct Handler {
    tx: mpsc::UnboundedSender<IncomingMessage>,
    allowed_guilds: Vec<u64>,
    allowed_users: Vec<u64>,
    http_store: Arc<RwLock<Option<Arc<serenity::http::Http>>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        if let Some(guild_id) = msg.guild_id {
            if !self.allowed_guilds.is_empty() && !self.allowed_guilds.contains(&guild_id.get()) {
                return;
            }
        }
        if !self.allowed_users.is_empty() && !self.allowed_users.contains(&msg.author.id.get()) {
            return;
        }

        let content = msg.content.clone();
        if content.is_empty() {
            return;
        }

        let channel_id = msg.channel_id;
        let incoming = IncomingMessage {
            channel: "discord".into(),
            sender_id: msg.author.id.get().to_string(),
            sender_name: Some(msg.author.name.clone()),
            session_id: format!("dc-{}", channel_id.get()),
            content,
            reply_to: msg.referenced_message.as_ref().map(|m| m.id.get().to_string()),
            timestamp: now_ms(),
            worker_hint: None,
        };

        let _ = self.tx.send(incoming);
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(bot = %ready.user.name, "discord bot connected");
        *self.http_store.write().await = Some(ctx.http.clone());
    }
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    async fn start(&self, tx: mpsc::UnboundedSender<IncomingMessage>) -> Result<(), anyhow::Error> {
        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT | GatewayIntents::DIRECT_MESSAGES;

        let handler = Handler {
            tx,
            allowed_guilds: self.config.allowed_guilds.clone(),
            allowed_users: self.config.allowed_users.clone(),
            http_store: self.http.clone(),
        };

        let mut client = serenity::Client::builder(&self.config.bot_token, intents).event_handler(handler).await?;

        tokio::spawn(async move {
            if let Err(err) = client.start().await {
                tracing::error!(%err, "discord client error");
            }
        });

        tracing::info!("discord adapter started");
        Ok(())
    }

    async fn send(&self, msg: OutgoingMessage) -> Result<(), anyhow::Error> {
        let channel_id: u64 = msg.session_id.strip_prefix("dc-").and_then(|s| s.parse().ok()).ok_or_else(|| anyhow::anyhow!("invalid discord session_id: {}", msg.session_id))?;

        let http = self.http.read().await;
        let http = http.as_ref().ok_or_else(|| anyhow::anyhow!("discord http client not ready"))?;

        for chunk in split_message(&msg.content, 2000) {
            let builder = CreateMessage::new().content(&chunk);
            ChannelId::new(channel_id).send_message(http.as_ref(), builder).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "discord"
    }
}

/// Parse a Discord session_id back to a channel_id.
pub fn parse_discord_session(session_id: &str) -> Option<u64> {
    session_id.strip_prefix("dc-").and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discord_session() {
        assert_eq!(parse_discord_session("dc-123456789"), Some(123456789));
        assert_eq!(parse_discord_session("tg-123"), None);
        assert_eq!(parse_discord_session("dc-abc"), None);
        assert_eq!(parse_discord_session(""), None);
    }
}
