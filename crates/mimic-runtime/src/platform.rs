//! Messaging-platform seam: normalized inbound messages and the outbound operations the bot needs.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
/// The account the bot runs as.
pub struct BotIdentity {
    pub id: i64,
    pub first_name: String,
    pub username: Option<String>,
}

impl BotIdentity {
    pub fn display_name(&self) -> String {
        match &self.username {
            Some(username) => format!("{} (@{username})", self.first_name),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Document { mime_type: Option<String> },
    Sticker { animated: bool },
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document { .. } => "document",
            Self::Sticker { .. } => "sticker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Attachment reference; bytes are fetched lazily with `download_media`.
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub file_id: String,
    pub file_name: Option<String>,
}

impl MediaAttachment {
    pub fn is_video(&self) -> bool {
        matches!(self.kind, MediaKind::Video)
    }

    /// Whether the attachment can be shown to the model as an image.
    pub fn is_relayable(&self) -> bool {
        match &self.kind {
            MediaKind::Photo => true,
            MediaKind::Video => false,
            MediaKind::Document { mime_type } => mime_type
                .as_deref()
                .is_some_and(|mime_type| mime_type.starts_with("image/")),
            MediaKind::Sticker { animated } => !animated,
        }
    }

    /// File name used when handing the bytes to the media relay.
    pub fn relay_file_name(&self, message_id: i64) -> String {
        if let Some(file_name) = self
            .file_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
        {
            return file_name.to_string();
        }
        match &self.kind {
            MediaKind::Photo => format!("photo_{message_id}.jpg"),
            MediaKind::Video => format!("video_{message_id}.mp4"),
            MediaKind::Sticker { .. } => format!("sticker_{message_id}.webp"),
            MediaKind::Document { .. } => format!("document_{message_id}.dat"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One inbound chat message, normalized from a platform update.
pub struct InboundMessage {
    pub update_id: i64,
    pub message_id: i64,
    pub sender_id: i64,
    pub chat_id: i64,
    pub is_private: bool,
    /// Platform send time, seconds since the Unix epoch (0 when unknown).
    pub sent_at_unix: i64,
    pub text: String,
    pub media: Option<MediaAttachment>,
}

impl InboundMessage {
    /// Normalizes a raw Bot API update. Returns `None` for updates that are
    /// not plain messages or have no sender.
    pub fn from_update(update: &Value) -> Option<Self> {
        let update = TelegramUpdate::deserialize(update).ok()?;
        let message = update.message?;
        let sender_id = message.from.as_ref()?.id;
        let media = message.media_attachment();
        let raw_text = message
            .text
            .or(message.caption)
            .unwrap_or_default()
            .trim()
            .to_string();
        // Clients send placeholders like "[GIF]" alongside bare media.
        let text = if media.is_some() && raw_text.starts_with('[') {
            String::new()
        } else {
            raw_text
        };
        Some(Self {
            update_id: update.update_id,
            message_id: message.message_id,
            sender_id,
            chat_id: message.chat.id,
            is_private: message.chat.kind == "private",
            sent_at_unix: message.date,
            text,
            media,
        })
    }

    pub fn chat_label(&self) -> &'static str {
        if self.is_private {
            "private"
        } else {
            "group"
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// One long-poll batch.
pub struct PolledUpdates {
    /// Offset to pass to the next poll, if any update was seen.
    pub next_offset: Option<i64>,
    pub messages: Vec<InboundMessage>,
}

impl PolledUpdates {
    pub fn from_raw_updates(updates: &[Value]) -> Self {
        let mut next_offset: Option<i64> = None;
        let mut messages = Vec::new();
        for update in updates {
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                let candidate = update_id.saturating_add(1);
                next_offset = Some(next_offset.map_or(candidate, |offset| offset.max(candidate)));
            }
            if let Some(message) = InboundMessage::from_update(update) {
                messages.push(message);
            }
        }
        Self {
            next_offset,
            messages,
        }
    }
}

#[async_trait]
/// Operations the runtime needs from the messaging platform.
pub trait MessagingPlatform: Send + Sync {
    async fn bot_identity(&self) -> Result<BotIdentity>;
    async fn poll_updates(&self, offset: Option<i64>) -> Result<PolledUpdates>;
    async fn download_media(&self, media: &MediaAttachment) -> Result<Vec<u8>>;
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;
    async fn send_media(&self, chat_id: i64, url: &str) -> Result<()>;
    /// Whether the bot itself may post into `chat_id`.
    async fn send_permission(&self, chat_id: i64) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TelegramUser>,
    chat: TelegramChat,
    #[serde(default)]
    date: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<TelegramPhotoSize>,
    #[serde(default)]
    video: Option<TelegramFile>,
    #[serde(default)]
    document: Option<TelegramFile>,
    #[serde(default)]
    sticker: Option<TelegramSticker>,
}

impl TelegramMessage {
    fn media_attachment(&self) -> Option<MediaAttachment> {
        if let Some(largest) = self
            .photo
            .iter()
            .max_by_key(|size| (size.width.saturating_mul(size.height), size.file_size))
        {
            return Some(MediaAttachment {
                kind: MediaKind::Photo,
                file_id: largest.file_id.clone(),
                file_name: None,
            });
        }
        if let Some(video) = &self.video {
            return Some(MediaAttachment {
                kind: MediaKind::Video,
                file_id: video.file_id.clone(),
                file_name: video.file_name.clone(),
            });
        }
        if let Some(sticker) = &self.sticker {
            return Some(MediaAttachment {
                kind: MediaKind::Sticker {
                    animated: sticker.is_animated || sticker.is_video,
                },
                file_id: sticker.file_id.clone(),
                file_name: None,
            });
        }
        self.document.as_ref().map(|document| MediaAttachment {
            kind: MediaKind::Document {
                mime_type: document.mime_type.clone(),
            },
            file_id: document.file_id.clone(),
            file_name: document.file_name.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TelegramPhotoSize {
    file_id: String,
    #[serde(default)]
    width: u64,
    #[serde(default)]
    height: u64,
    #[serde(default)]
    file_size: u64,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramSticker {
    file_id: String,
    #[serde(default)]
    is_animated: bool,
    #[serde(default)]
    is_video: bool,
}
