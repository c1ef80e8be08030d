use mimic_ai::{ContentBlock, Message, MessageRole};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageReference {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageReference },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
/// Plain text, or the multi-part form used when a turn references an image.
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One role-tagged message of a transcript. Persisted in the chat-completions
/// message shape so stored history reads like the API payload it feeds.
pub struct Turn {
    pub role: TurnRole,
    pub content: TurnContent,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(TurnRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(TurnRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(TurnRole::Assistant, text)
    }

    pub fn user_image(url: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: TurnContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageReference { url: url.into() },
            }]),
        }
    }

    fn text(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == TurnRole::System
    }

    pub fn text_content(&self) -> String {
        match &self.content {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        let role = match turn.role {
            TurnRole::System => MessageRole::System,
            TurnRole::User => MessageRole::User,
            TurnRole::Assistant => MessageRole::Assistant,
        };
        let content = match &turn.content {
            TurnContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            TurnContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
                    ContentPart::ImageUrl { image_url } => {
                        ContentBlock::image_url(image_url.url.clone())
                    }
                })
                .collect(),
        };
        Message { role, content }
    }
}
