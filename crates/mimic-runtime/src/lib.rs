//! Runtime for the mimic persona bot: debounced replies, permission checks,
//! the reply pipeline and the Telegram Bot API connector.

pub mod config;
pub mod conversation_runtime;
pub mod directive;
pub mod image_search;
pub mod logging;
pub mod media_relay;
pub mod permission;
pub mod persona;
pub mod pipeline;
pub mod platform;
pub mod scheduler;
pub mod telegram_api_client;

pub use config::{BotConfig, DelayPolicy, ImageSearchConfig};
pub use conversation_runtime::{
    ConversationRegistry, ConversationRuntime, ConversationRuntimeConfig, InboundDisposition,
    ReplyJobReport, DEFAULT_POLL_BACKOFF,
};
pub use directive::{parse_reply_directive, ReplyDirective};
pub use image_search::{ImageSearch, UnsplashImageSearch};
pub use logging::init_logging;
pub use media_relay::{direct_download_url, MediaRelay, TmpFilesRelay};
pub use permission::PermissionGate;
pub use persona::Profile;
pub use pipeline::{ReplyOutcome, ReplyPipeline};
pub use platform::{
    BotIdentity, InboundMessage, MediaAttachment, MediaKind, MessagingPlatform, PolledUpdates,
};
pub use scheduler::{
    ConversationKey, DebounceScheduler, JobOutcome, ReplyTicket, ScheduledReply, SlotState,
};
pub use telegram_api_client::TelegramApiClient;

pub(crate) fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
