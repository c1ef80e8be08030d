use std::sync::Arc;

use crate::platform::MessagingPlatform;
use crate::scheduler::ConversationKey;

/// Decides whether the bot may post into a conversation before a reply is generated.
pub struct PermissionGate {
    platform: Arc<dyn MessagingPlatform>,
}

impl PermissionGate {
    pub fn new(platform: Arc<dyn MessagingPlatform>) -> Self {
        Self { platform }
    }

    /// Private chats are always allowed. Group lookups that fail deny.
    pub async fn can_post(&self, key: &ConversationKey, is_private: bool) -> bool {
        if is_private {
            return true;
        }
        match self.platform.send_permission(key.chat_id).await {
            Ok(allowed) => allowed,
            Err(error) => {
                tracing::warn!(
                    user_id = %key.user_id,
                    chat_id = key.chat_id,
                    error = %format!("{error:#}"),
                    "send permission lookup failed; treating as denied"
                );
                false
            }
        }
    }
}
