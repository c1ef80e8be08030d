//! Telegram Bot API client used for polling, delivery and permission lookups.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use crate::platform::{BotIdentity, MediaAttachment, MessagingPlatform, PolledUpdates};
use crate::truncate_for_error;

#[derive(Debug, Deserialize)]
struct TelegramEnvelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramGetMeResult {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramFileResult {
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChatMember {
    status: String,
    #[serde(default)]
    can_post_messages: Option<bool>,
    #[serde(default)]
    can_send_messages: Option<bool>,
}

impl TelegramChatMember {
    fn can_send(&self) -> bool {
        match self.status.as_str() {
            "creator" | "member" => true,
            // Channel administrators carry `can_post_messages`; group ones do not.
            "administrator" => self.can_post_messages.unwrap_or(true),
            "restricted" => self.can_send_messages.unwrap_or(false),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct TelegramApiClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    poll_timeout_seconds: u64,
    identity: Arc<OnceCell<BotIdentity>>,
}

impl TelegramApiClient {
    pub fn new(
        api_base: &str,
        bot_token: &str,
        request_timeout_ms: u64,
        poll_timeout_seconds: u64,
    ) -> Result<Self> {
        let bot_token = bot_token.trim();
        if bot_token.is_empty() {
            bail!("telegram bot token cannot be empty");
        }
        let api_base = api_base.trim().trim_end_matches('/');
        if api_base.is_empty() {
            bail!("telegram api base cannot be empty");
        }
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("mimic-bot"),
        );
        // Long polls must outlive the server-side wait.
        let timeout = Duration::from_millis(request_timeout_ms.max(1))
            .max(Duration::from_secs(poll_timeout_seconds.saturating_add(10)));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to create telegram api client")?;

        Ok(Self {
            http,
            api_base: api_base.to_string(),
            bot_token: bot_token.to_string(),
            poll_timeout_seconds,
            identity: Arc::new(OnceCell::new()),
        })
    }

    // Both URLs embed the bot token; transport errors are stripped of them before logging.
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.api_base,
            self.bot_token,
            file_path.trim_start_matches('/')
        )
    }

    async fn call<T>(&self, method: &str, payload: &Value) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.method_url(method))
            .json(payload)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("telegram api {method} request failed"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("failed to read telegram {method} response"))?;
        let envelope = serde_json::from_str::<TelegramEnvelope<T>>(&body).map_err(|error| {
            anyhow!(
                "telegram api {method} failed with status {}: {} ({error})",
                status.as_u16(),
                truncate_for_error(&body, 800)
            )
        })?;
        if !status.is_success() || !envelope.ok {
            bail!(
                "telegram api {method} failed with status {}: {}",
                status.as_u16(),
                envelope
                    .description
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }
        envelope
            .result
            .ok_or_else(|| anyhow!("telegram api {method} response missing result"))
    }

    async fn fetch_identity(&self) -> Result<BotIdentity> {
        let me: TelegramGetMeResult = self.call("getMe", &json!({})).await?;
        Ok(BotIdentity {
            id: me.id,
            first_name: me.first_name,
            username: me.username.filter(|value| !value.trim().is_empty()),
        })
    }
}

#[async_trait]
impl MessagingPlatform for TelegramApiClient {
    async fn bot_identity(&self) -> Result<BotIdentity> {
        self.identity
            .get_or_try_init(|| self.fetch_identity())
            .await
            .cloned()
    }

    async fn poll_updates(&self, offset: Option<i64>) -> Result<PolledUpdates> {
        let mut payload = json!({
            "timeout": self.poll_timeout_seconds,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }
        let updates: Vec<Value> = self.call("getUpdates", &payload).await?;
        Ok(PolledUpdates::from_raw_updates(&updates))
    }

    async fn download_media(&self, media: &MediaAttachment) -> Result<Vec<u8>> {
        let file: TelegramFileResult = self
            .call("getFile", &json!({ "file_id": media.file_id }))
            .await?;
        let file_path = file
            .file_path
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("telegram getFile did not return file_path"))?;
        let response = self
            .http
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("telegram file download request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "telegram file download failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 320)
            );
        }
        Ok(response
            .bytes()
            .await
            .map_err(reqwest::Error::without_url)
            .context("failed to read telegram file body")?
            .to_vec())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        let _: Value = self
            .call("sendMessage", &json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    async fn send_media(&self, chat_id: i64, url: &str) -> Result<()> {
        let _: Value = self
            .call("sendPhoto", &json!({ "chat_id": chat_id, "photo": url }))
            .await?;
        Ok(())
    }

    async fn send_permission(&self, chat_id: i64) -> Result<bool> {
        let identity = self.bot_identity().await?;
        let member: TelegramChatMember = self
            .call(
                "getChatMember",
                &json!({ "chat_id": chat_id, "user_id": identity.id }),
            )
            .await?;
        Ok(member.can_send())
    }
}
