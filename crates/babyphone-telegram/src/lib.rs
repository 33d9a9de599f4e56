//! Babyphone Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! reply/inline keyboards, callback queries, photo upload and message chunking

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use babyphone_config::TelegramConfig;
use babyphone_ipc::{Envelope, EventBus, InboundEvent, Markup, Responder};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
const CHANNEL_NAME: &str = "telegram";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}

/// Entry of the `/` autocomplete menu.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: T,
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    api_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    bot_commands: Vec<BotCommand>,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str, config: &TelegramConfig, data_dir: PathBuf) -> Result<Self> {
        let api_url = format!("https://api.telegram.org/bot{}", bot_token);
        Ok(Self {
            client: Self::build_client()?,
            bot_token: bot_token.to_string(),
            api_url,
            data_dir,
            poll_timeout_secs: config.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: config.client_recreate_interval_secs.unwrap_or(60),
            bot_commands: Vec::new(),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_bot_commands(mut self, commands: Vec<BotCommand>) -> Self {
        self.bot_commands = commands;
        self
    }

    fn build_client() -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))
    }

    fn bot_id(&self) -> String {
        TelegramConfig::account_tag(&self.bot_token)
    }

    fn offset_path(&self) -> PathBuf {
        self.data_dir
            .join("runtime")
            .join(format!("telegram.{}.offset", self.bot_id()))
    }

    async fn read_offset(&self) -> Option<i64> {
        match fs::read_to_string(self.offset_path()).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let p = self.offset_path();
        if let Some(parent) = p.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::write(&p, format!("{}\n", offset)).await {
            debug!("Failed to persist Telegram offset to {}: {}", p.display(), e);
        }
    }

    /// Calls `getMe`; returns the bot username.
    pub async fn get_me(&self) -> Result<String> {
        let url = format!("{}/getMe", self.api_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getMe request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getMe HTTP error: {}", e))?;

        let parsed: ApiResponse<TelegramUser> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getMe decode failed: {}", e))?;
        if !parsed.ok {
            return Err(anyhow!("telegram getMe returned ok=false"));
        }

        Ok(parsed
            .result
            .username
            .unwrap_or_else(|| parsed.result.id.to_string()))
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let url = format!("{}/getUpdates", self.api_url);

        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getUpdates request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getUpdates HTTP error: {}", e))?;

        let parsed: ApiResponse<Vec<TelegramUpdate>> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getUpdates decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!("telegram getUpdates returned ok=false"));
        }

        Ok(parsed.result)
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&Markup>,
    ) -> Result<()> {
        let chunks = self.chunk_message(text);
        let url = format!("{}/sendMessage", self.api_url);

        for (i, chunk) in chunks.iter().enumerate() {
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });

            if i == chunks.len() - 1 {
                if let Some(markup) = markup {
                    payload["reply_markup"] = Self::reply_markup(markup);
                }
            }

            self.send_with_markdown_fallback(&url, payload).await?;
        }

        Ok(())
    }

    pub async fn send_photo(&self, chat_id: i64, image: Vec<u8>) -> Result<()> {
        let url = format!("{}/sendPhoto", self.api_url);

        let part = reqwest::multipart::Part::bytes(image)
            .file_name("snapshot.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| anyhow!("telegram sendPhoto mime error: {}", e))?;

        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", part);

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| anyhow!("telegram sendPhoto request failed: {}", e))?;

        Self::check_response(resp, "sendPhoto").await
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let url = format!("{}/deleteMessage", self.api_url);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram deleteMessage request failed: {}", e))?;

        Self::check_response(resp, "deleteMessage").await
    }

    /// Stops the client-side spinner of a pressed inline button.
    pub async fn answer_callback_query(&self, callback_query_id: &str) -> Result<()> {
        let url = format!("{}/answerCallbackQuery", self.api_url);
        let payload = serde_json::json!({
            "callback_query_id": callback_query_id,
        });

        let _ = self.client.post(&url).json(&payload).send().await;
        Ok(())
    }

    fn reply_markup(markup: &Markup) -> serde_json::Value {
        match markup {
            Markup::Keyboard(rows) => serde_json::json!({
                "keyboard": rows.iter().map(|row| {
                    row.iter().map(|label| serde_json::json!({ "text": label })).collect::<Vec<_>>()
                }).collect::<Vec<_>>(),
                "resize_keyboard": true,
            }),
            Markup::Inline(rows) => serde_json::json!({
                "inline_keyboard": rows.iter().map(|row| {
                    row.iter().map(|btn| serde_json::json!({
                        "text": btn.text,
                        "callback_data": btn.callback_data
                    })).collect::<Vec<_>>()
                }).collect::<Vec<_>>()
            }),
        }
    }

    async fn check_response(resp: reqwest::Response, endpoint: &str) -> Result<()> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram {} HTTP {}: {}", endpoint, status, body));
        }

        let parsed: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} decode failed: {}", endpoint, e))?;
        if !parsed.ok {
            return Err(anyhow!("telegram {} returned ok=false", endpoint));
        }
        Ok(())
    }

    async fn send_with_markdown_fallback(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let endpoint = url.rsplit('/').next().unwrap_or("telegram");

        let first_resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", endpoint, e))?;

        if first_resp.status().is_success() {
            let parsed: ApiResponse<serde_json::Value> = first_resp
                .json()
                .await
                .map_err(|e| anyhow!("telegram {} decode failed: {}", endpoint, e))?;
            if parsed.ok {
                return Ok(());
            }
            warn!(
                "telegram {} returned ok=false with Markdown payload, retrying without parse_mode",
                endpoint
            );
        } else {
            let status = first_resp.status();
            let body = first_resp.text().await.unwrap_or_default();
            warn!(
                "telegram {} HTTP {} with Markdown payload, retrying without parse_mode: {}",
                endpoint, status, body
            );
        }

        let mut fallback_payload = payload;
        if let Some(obj) = fallback_payload.as_object_mut() {
            obj.remove("parse_mode");
        }

        let fallback_resp = self
            .client
            .post(url)
            .json(&fallback_payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} fallback request failed: {}", endpoint, e))?;

        Self::check_response(fallback_resp, endpoint).await
    }

    fn chunk_message(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

            if end < chars.len() {
                let mut split = end;
                for i in (start..end).rev() {
                    let c = chars[i];
                    if c == '\n' || c == ' ' || c == '.' || c == '!' || c == '?' {
                        split = i + 1;
                        break;
                    }
                }
                if split > start {
                    end = split;
                }
            }

            chunks.push(chars[start..end].iter().collect::<String>());
            start = end;
        }

        chunks
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                match Self::build_client() {
                    Ok(fresh) => client = fresh,
                    Err(e) => warn!("Keeping previous HTTP client: {}", e),
                }
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if let Some(message) = &update.message {
                    self.handle_message(message);
                }

                if let Some(callback) = &update.callback_query {
                    self.handle_callback(callback).await;
                }
            }
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        if self.bot_commands.is_empty() {
            return Ok(());
        }

        let url = format!("{}/setMyCommands", self.api_url);
        let payload = serde_json::json!({ "commands": self.bot_commands });
        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram setMyCommands request failed: {}", e))?;

        Self::check_response(resp, "setMyCommands").await
    }

    fn publish(&self, event: InboundEvent) {
        if let Some(event_bus) = &self.event_bus {
            if let Err(e) = event_bus.publish(Envelope::new(CHANNEL_NAME, event)) {
                warn!("Failed to publish {} to event bus: {}", CHANNEL_NAME, e);
            }
        } else {
            info!("No event bus configured, update not forwarded");
        }
    }

    fn handle_message(&self, message: &TelegramMessage) {
        match message_event(message) {
            Some(event) => {
                let from_username = message
                    .from
                    .as_ref()
                    .and_then(|u| u.username.as_deref())
                    .unwrap_or("unknown");
                info!(
                    "Received message from {}: {}",
                    from_username,
                    loggable_text(event.raw())
                );
                self.publish(event);
            }
            None => debug!(
                "Skipping message {} without text in chat {}",
                message.message_id, message.chat.id
            ),
        }
    }

    async fn handle_callback(&self, callback: &TelegramCallbackQuery) {
        info!("Received callback query: {:?}", callback.data);

        match callback_event(callback) {
            Some(event) => self.publish(event),
            None => debug!("Skipping callback {} without origin message", callback.id),
        }

        let _ = self.answer_callback_query(&callback.id).await;
    }
}

/// Message text as written to the log. Arguments of `/start` carry the
/// PIN and are masked.
pub fn loggable_text(text: &str) -> String {
    let trimmed = text.trim();
    let (word, rest) = match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim()),
        None => (trimmed, ""),
    };
    let command = word.split('@').next().unwrap_or(word);
    if command.eq_ignore_ascii_case("/start") && !rest.is_empty() {
        format!("{} ***", word)
    } else {
        text.to_string()
    }
}

/// Converts a text message into a command event. Non-text messages yield `None`.
pub fn message_event(message: &TelegramMessage) -> Option<InboundEvent> {
    let text = message.text.clone()?;
    let sender_id = message.from.as_ref().map(|u| u.id).unwrap_or(message.chat.id);
    Some(InboundEvent::Command {
        sender_id,
        session_id: message.chat.id,
        text,
        message_id: Some(message.message_id),
    })
}

/// Converts a callback query into a callback event. Queries without the
/// originating message cannot be retracted or attributed to a chat.
pub fn callback_event(callback: &TelegramCallbackQuery) -> Option<InboundEvent> {
    let message = callback.message.as_ref()?;
    Some(InboundEvent::Callback {
        sender_id: callback.from.id,
        session_id: message.chat.id,
        data: callback.data.clone().unwrap_or_default(),
        prompt_message_id: message.message_id,
        query_id: callback.id.clone(),
    })
}

#[async_trait]
impl Responder for TelegramAdapter {
    async fn send_text(&self, chat_id: i64, text: &str, markup: Option<Markup>) -> Result<()> {
        self.send_message(chat_id, text, markup.as_ref()).await
    }

    async fn send_photo(&self, chat_id: i64, image: Vec<u8>) -> Result<()> {
        TelegramAdapter::send_photo(self, chat_id, image).await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        TelegramAdapter::delete_message(self, chat_id, message_id).await
    }
}
