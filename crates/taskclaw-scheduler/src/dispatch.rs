//! HTTP alert channels — Telegram Bot API, Discord webhook, generic JSON webhook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskclaw_core::config::NotifyConfig;
use taskclaw_core::error::{Result, TaskClawError};

use crate::notify::{Notification, NotifyChannel, NotifyPriority};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Telegram Bot API `sendMessage`.
pub struct TelegramChannel {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        }
    }
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let text = format!(
            "{} *{}*\n\n{}\n\n_Trigger: {} • {}_",
            priority_emoji(notification.priority),
            escape_markdown(&notification.title),
            escape_markdown(&notification.body),
            escape_markdown(&notification.source),
            notification.timestamp.format("%H:%M:%S UTC")
        );

        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "Markdown"
            }))
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .map_err(|e| TaskClawError::Http(format!("Telegram send failed: {e}")))?;
        check_response("Telegram", resp).await
    }
}

/// Discord webhook with a colored embed.
pub struct DiscordChannel {
    client: reqwest::Client,
    webhook_url: String,
}

impl DiscordChannel {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.to_string(),
        }
    }
}

#[async_trait]
impl NotifyChannel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let color = match notification.priority {
            NotifyPriority::Urgent => 0xFF0000,
            NotifyPriority::High => 0xFF8800,
            NotifyPriority::Normal => 0x00AAFF,
            NotifyPriority::Low => 0x888888,
        };
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({
                "embeds": [{
                    "title": notification.title,
                    "description": notification.body,
                    "color": color,
                    "footer": {
                        "text": format!(
                            "Trigger: {} • {}",
                            notification.source,
                            notification.timestamp.format("%H:%M:%S UTC")
                        )
                    }
                }]
            }))
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .map_err(|e| TaskClawError::Http(format!("Discord send failed: {e}")))?;
        check_response("Discord", resp).await
    }
}

/// POSTs the notification as JSON.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookChannel {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(notification)
            .timeout(SEND_TIMEOUT);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TaskClawError::Http(format!("Webhook send failed: {e}")))?;
        check_response("Webhook", resp).await
    }
}

async fn check_response(channel: &str, resp: reqwest::Response) -> Result<()> {
    if resp.status().is_success() {
        tracing::info!("✅ {} alert sent", channel);
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(TaskClawError::Notify(format!("{channel} error {status}: {body}")))
    }
}

fn priority_emoji(priority: NotifyPriority) -> &'static str {
    match priority {
        NotifyPriority::Urgent => "🚨",
        NotifyPriority::High => "⚠️",
        NotifyPriority::Normal => "📢",
        NotifyPriority::Low => "ℹ️",
    }
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

/// Build the HTTP channels the `[notify]` section configures. Empty values are skipped;
/// Telegram needs both token and chat id.
pub fn channels_from_config(config: &NotifyConfig) -> Vec<Arc<dyn NotifyChannel>> {
    let mut channels: Vec<Arc<dyn NotifyChannel>> = Vec::new();

    if !config.telegram_bot_token.is_empty() {
        if config.telegram_chat_id.is_empty() {
            tracing::warn!("⚠️ telegram_bot_token set without telegram_chat_id; Telegram alerts disabled");
        } else {
            channels.push(Arc::new(TelegramChannel::new(
                &config.telegram_bot_token,
                &config.telegram_chat_id,
            )));
        }
    }
    if !config.discord_webhook_url.is_empty() {
        channels.push(Arc::new(DiscordChannel::new(&config.discord_webhook_url)));
    }
    if !config.webhook_url.is_empty() {
        channels.push(Arc::new(WebhookChannel::new(&config.webhook_url)));
    }
    channels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("daily_report *now*"), "daily\\_report \\*now\\*");
    }

    #[test]
    fn test_channels_from_config() {
        assert!(channels_from_config(&NotifyConfig::default()).is_empty());

        let config = NotifyConfig {
            webhook_url: "https://hooks.example.com/taskclaw".into(),
            discord_webhook_url: "https://discord.com/api/webhooks/1/abc".into(),
            telegram_bot_token: "123:abc".into(),
            telegram_chat_id: String::new(),
        };
        let names: Vec<String> = channels_from_config(&config)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["discord", "webhook"]);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let channel = WebhookChannel::new("http://127.0.0.1:9/unreachable").with_header("X-Test", "1");
        let notification = Notification::new("t", "b", "job", NotifyPriority::Low);
        assert!(matches!(
            channel.send(&notification).await,
            Err(TaskClawError::Http(_))
        ));
    }
}
