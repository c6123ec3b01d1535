//! Telegram Bot API client.
//!
//! Every method is a JSON `POST /bot<token>/<method>`. Error bodies carry
//! `error_code`, `description` and, for 429, `parameters.retry_after`; those
//! are mapped onto [`ChatError`] so the messenger can apply its retry policy.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::messaging::{ChatApi, ChatError, Keyboard, MessageRef};
use crate::pipeline::{InboundVideo, VideoSource};
use crate::progress::ProgressReporter;

const PARSE_MODE: &str = "Markdown";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub video: Option<Video>,
}

impl Message {
    pub fn reference(&self) -> MessageRef {
        MessageRef {
            chat_id: self.chat.id,
            message_id: self.message_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Video {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotCommand {
    pub command: &'static str,
    pub description: &'static str,
}

pub struct TelegramClient {
    http: Client,
    api_base: String,
    token: String,
}

impl TelegramClient {
    pub fn new(http: Client, api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<T, ChatError> {
        let url = format!("{}/bot{}/{method}", self.api_base, self.token);
        let mut request = self.http.post(url).json(payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        // Urls embed the bot token; strip them from transport errors.
        let response = request.send().await.map_err(|e| e.without_url())?;
        let status = response.status();
        let body: ApiResponse<T> = response.json().await.map_err(|e| e.without_url())?;
        into_result(method, status.as_u16(), body)
    }

    /// Long-polls for updates after `offset`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, ChatError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
            Some(Duration::from_secs(timeout_secs + 10)),
        )
        .await
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<(), ChatError> {
        let mut payload = json!({
            "callback_query_id": callback_query_id,
            "show_alert": show_alert,
        });
        if let Some(text) = text {
            payload["text"] = json!(text);
        }
        self.call::<bool>("answerCallbackQuery", &payload, None).await?;
        Ok(())
    }

    pub async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<(), ChatError> {
        self.call::<bool>("setMyCommands", &json!({ "commands": commands }), None)
            .await?;
        info!("registered {} bot commands", commands.len());
        Ok(())
    }

    pub async fn get_file(&self, file_id: &str) -> Result<RemoteFile, ChatError> {
        self.call("getFile", &json!({ "file_id": file_id }), None).await
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{file_path}", self.api_base, self.token)
    }
}

fn into_result<T>(method: &str, status: u16, body: ApiResponse<T>) -> Result<T, ChatError> {
    if body.ok {
        return body
            .result
            .ok_or_else(|| ChatError::Api(format!("{method}: response without result")));
    }

    let description = body.description.unwrap_or_default();
    let code = body.error_code.unwrap_or(i64::from(status));
    let retry_after = body.parameters.and_then(|p| p.retry_after);
    if code == 429 || retry_after.is_some() {
        return Err(ChatError::RateLimited(Duration::from_secs(retry_after.unwrap_or(1))));
    }
    if description.contains("message is not modified") {
        return Err(ChatError::NotModified);
    }
    Err(ChatError::Api(format!("{method} failed ({code}): {description}")))
}

fn message_payload(text: &str, keyboard: Option<&Keyboard>) -> Value {
    let mut payload = json!({ "text": text, "parse_mode": PARSE_MODE });
    if let Some(keyboard) = keyboard {
        payload["reply_markup"] = json!(keyboard);
    }
    payload
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError> {
        let mut payload = message_payload(text, keyboard);
        payload["chat_id"] = json!(chat_id);
        let sent: Message = self.call("sendMessage", &payload, None).await?;
        Ok(sent.reference())
    }

    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError> {
        let mut payload = message_payload(text, keyboard);
        payload["chat_id"] = json!(message.chat_id);
        payload["message_id"] = json!(message.message_id);
        // Result is the edited message, or `true` for inline messages.
        self.call::<Value>("editMessageText", &payload, None).await?;
        Ok(())
    }

    async fn reply_to(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError> {
        let mut payload = message_payload(text, keyboard);
        payload["chat_id"] = json!(message.chat_id);
        payload["reply_parameters"] = json!({
            "message_id": message.message_id,
            "allow_sending_without_reply": true,
        });
        let sent: Message = self.call("sendMessage", &payload, None).await?;
        Ok(sent.reference())
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), ChatError> {
        self.call::<bool>(
            "deleteMessage",
            &json!({ "chat_id": message.chat_id, "message_id": message.message_id }),
            None,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl VideoSource for TelegramClient {
    async fn download(&self, video: &InboundVideo, dest: &Path, progress: ProgressReporter) -> Result<u64> {
        let remote = self.get_file(&video.file_id).await?;
        let file_path = remote
            .file_path
            .context("Telegram did not return a download path for this file")?;

        let response = self
            .http
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|e| e.without_url())
            .context("file download request failed")?;
        if !response.status().is_success() {
            bail!("file download failed: {}", response.status());
        }

        let total = response
            .content_length()
            .or(remote.file_size)
            .or(video.file_size)
            .unwrap_or(0);
        debug!("item {}: downloading {total} bytes to {}", video.item_id, dest.display());

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut downloaded = 0u64;
        progress.report(0, total)?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| e.without_url()).context("file download interrupted")?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("failed to write {}", dest.display()))?;
            downloaded += bytes.len() as u64;
            progress.report(downloaded, total)?;
        }
        file.flush().await?;

        info!("item {}: downloaded {downloaded} bytes", video.item_id);
        Ok(downloaded)
    }
}
