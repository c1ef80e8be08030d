//! Static settings document and the reply-delay policy derived from it.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MEDIA_RELAY_BASE: &str = "https://tmpfiles.org";
const DEFAULT_IMAGE_SEARCH_API_BASE: &str = "https://api.unsplash.com";
const MIN_MESSAGE_HISTORY: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Credentials for the optional image-search collaborator.
pub struct ImageSearchConfig {
    #[serde(default = "default_image_search_api_base")]
    pub api_base: String,
    pub access_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `BotConfig` used across mimic components.
pub struct BotConfig {
    pub telegram_bot_token: String,
    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,
    pub openai_api_key: String,
    pub openai_model: String,
    #[serde(default = "default_openai_api_base")]
    pub openai_api_base: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub owner_user_id: Option<i64>,
    #[serde(default = "default_max_message_history")]
    pub max_message_history: usize,
    #[serde(default = "default_reply_delay_min_seconds")]
    pub reply_delay_min_seconds: f64,
    #[serde(default = "default_reply_delay_max_seconds")]
    pub reply_delay_max_seconds: f64,
    #[serde(default = "default_media_relay_base")]
    pub media_relay_base: String,
    #[serde(default)]
    pub image_search: Option<ImageSearchConfig>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_poll_timeout_seconds")]
    pub poll_timeout_seconds: u64,
}

fn default_telegram_api_base() -> String {
    DEFAULT_TELEGRAM_API_BASE.to_string()
}

fn default_openai_api_base() -> String {
    DEFAULT_OPENAI_API_BASE.to_string()
}

fn default_media_relay_base() -> String {
    DEFAULT_MEDIA_RELAY_BASE.to_string()
}

fn default_image_search_api_base() -> String {
    DEFAULT_IMAGE_SEARCH_API_BASE.to_string()
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_max_message_history() -> usize {
    20
}

fn default_reply_delay_min_seconds() -> f64 {
    30.0
}

fn default_reply_delay_max_seconds() -> f64 {
    1_200.0
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("bot.log")
}

fn default_poll_timeout_seconds() -> u64 {
    30
}

impl BotConfig {
    /// Reads and validates the settings document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the settings document without validating it, so callers can
    /// apply overrides first.
    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram_bot_token.trim().is_empty() {
            bail!("config field 'telegram_bot_token' cannot be empty");
        }
        if self.openai_api_key.trim().is_empty() {
            bail!("config field 'openai_api_key' cannot be empty");
        }
        if self.openai_model.trim().is_empty() {
            bail!("config field 'openai_model' cannot be empty");
        }
        for (field, value) in [
            ("reply_delay_min_seconds", self.reply_delay_min_seconds),
            ("reply_delay_max_seconds", self.reply_delay_max_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("config field '{field}' must be a non-negative number of seconds");
            }
            if Duration::try_from_secs_f64(value).is_err() {
                bail!("config field '{field}' ({value}) is too large to be a delay");
            }
        }
        if self.reply_delay_min_seconds > self.reply_delay_max_seconds {
            bail!(
                "config field 'reply_delay_min_seconds' ({}) exceeds 'reply_delay_max_seconds' ({})",
                self.reply_delay_min_seconds,
                self.reply_delay_max_seconds
            );
        }
        if let Some(image_search) = &self.image_search {
            if image_search.access_key.trim().is_empty() {
                bail!("config field 'image_search.access_key' cannot be empty");
            }
        }
        Ok(())
    }

    /// Transcript capacity, never below one system turn plus one message.
    pub fn transcript_capacity(&self) -> usize {
        self.max_message_history.max(MIN_MESSAGE_HISTORY)
    }

    pub fn delay_policy(&self) -> DelayPolicy {
        if self.debug_mode {
            return DelayPolicy::Immediate;
        }
        let seconds = |value: f64| Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX);
        DelayPolicy::Uniform {
            min: seconds(self.reply_delay_min_seconds),
            max: seconds(self.reply_delay_max_seconds),
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("conversation_history.json")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How long a scheduled reply waits before it runs.
pub enum DelayPolicy {
    /// Debug mode: reply as soon as possible.
    Immediate,
    /// Normal mode: a fresh uniform draw per schedule, simulating human latency.
    Uniform { min: Duration, max: Duration },
}

impl DelayPolicy {
    pub fn sample(&self) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Uniform { min, max } if min >= max => min,
            Self::Uniform { min, max } => {
                let seconds = rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64());
                Duration::try_from_secs_f64(seconds).unwrap_or(max)
            }
        }
    }
}
