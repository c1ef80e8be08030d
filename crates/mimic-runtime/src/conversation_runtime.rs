//! Conversation runtime: inbound handling, debounced reply jobs and the long-poll loop.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use mimic_transcript::{TranscriptStore, Turn};

use crate::config::DelayPolicy;
use crate::media_relay::MediaRelay;
use crate::permission::PermissionGate;
use crate::pipeline::ReplyPipeline;
use crate::platform::{BotIdentity, InboundMessage, MessagingPlatform};
use crate::scheduler::{ConversationKey, DebounceScheduler, ReplyTicket};

pub const DEFAULT_POLL_BACKOFF: Duration = Duration::from_secs(5);

/// Shared conversation state: transcripts plus images waiting for the next reply.
///
/// Locks are held only for synchronous sections.
pub struct ConversationRegistry {
    store: Mutex<TranscriptStore>,
    pending_media: Mutex<HashMap<ConversationKey, String>>,
    capacity: usize,
}

impl ConversationRegistry {
    pub fn new(store: TranscriptStore, capacity: usize) -> Self {
        Self {
            store: Mutex::new(store),
            pending_media: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, TranscriptStore>> {
        self.store
            .lock()
            .map_err(|_| anyhow!("transcript store mutex is poisoned"))
    }

    fn lock_pending_media(&self) -> Result<MutexGuard<'_, HashMap<ConversationKey, String>>> {
        self.pending_media
            .lock()
            .map_err(|_| anyhow!("pending media mutex is poisoned"))
    }

    /// Appends, trims and persists one turn. Returns the transcript length.
    pub fn commit(&self, user_id: &str, turn: Turn) -> Result<usize> {
        let mut store = self.lock_store()?;
        let len = store
            .commit(user_id, turn, self.capacity)
            .with_context(|| format!("failed to commit turn for user {user_id}"))?;
        Ok(len)
    }

    pub fn snapshot(&self, user_id: &str) -> Result<Vec<Turn>> {
        let store = self.lock_store()?;
        Ok(store
            .transcript(user_id)
            .map(<[Turn]>::to_vec)
            .unwrap_or_else(|| vec![store.system_turn().clone()]))
    }

    /// Newer media replaces older media that has not been replied to yet.
    pub fn set_pending_media(&self, key: &ConversationKey, url: String) -> Result<()> {
        self.lock_pending_media()?.insert(key.clone(), url);
        Ok(())
    }

    pub fn take_pending_media(&self, key: &ConversationKey) -> Result<Option<String>> {
        Ok(self.lock_pending_media()?.remove(key))
    }

    pub fn pending_media(&self, key: &ConversationKey) -> Result<Option<String>> {
        Ok(self.lock_pending_media()?.get(key).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDisposition {
    Scheduled { generation: u64, delay: Duration },
    Ignored { reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a reply job ended.
pub enum ReplyJobReport {
    PermissionDenied,
    ShutdownRequested,
    NothingToSend,
    Delivered { text_sent: bool, media_sent: bool },
}

/// Collaborators and settings for a `ConversationRuntime`.
pub struct ConversationRuntimeConfig {
    pub platform: Arc<dyn MessagingPlatform>,
    pub relay: Arc<dyn MediaRelay>,
    pub pipeline: Arc<ReplyPipeline>,
    pub registry: Arc<ConversationRegistry>,
    pub delay_policy: DelayPolicy,
    pub debug_mode: bool,
    pub owner_user_id: Option<i64>,
    pub poll_backoff: Duration,
}

struct ReplyContext {
    platform: Arc<dyn MessagingPlatform>,
    registry: Arc<ConversationRegistry>,
    pipeline: Arc<ReplyPipeline>,
    gate: PermissionGate,
}

pub struct ConversationRuntime {
    context: Arc<ReplyContext>,
    relay: Arc<dyn MediaRelay>,
    scheduler: DebounceScheduler,
    delay_policy: DelayPolicy,
    debug_mode: bool,
    owner_user_id: Option<i64>,
    poll_backoff: Duration,
}

impl ConversationRuntime {
    pub fn new(config: ConversationRuntimeConfig) -> Self {
        let gate = PermissionGate::new(Arc::clone(&config.platform));
        Self {
            context: Arc::new(ReplyContext {
                platform: config.platform,
                registry: config.registry,
                pipeline: config.pipeline,
                gate,
            }),
            relay: config.relay,
            scheduler: DebounceScheduler::new(),
            delay_policy: config.delay_policy,
            debug_mode: config.debug_mode,
            owner_user_id: config.owner_user_id,
            poll_backoff: config.poll_backoff,
        }
    }

    pub fn scheduler(&self) -> &DebounceScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<ConversationRegistry> {
        &self.context.registry
    }

    fn ignore_reason(&self, identity: &BotIdentity, message: &InboundMessage) -> Option<&'static str> {
        if self.debug_mode {
            if let Some(owner) = self.owner_user_id {
                if message.sender_id != owner {
                    return Some("debug mode serves only the owner");
                }
            }
        } else if message.sender_id == identity.id {
            return Some("own message");
        }
        if message.media.as_ref().is_some_and(|media| media.is_video()) {
            return Some("video is not supported");
        }
        None
    }

    /// Records an inbound message and (re)schedules the conversation's reply.
    ///
    /// The user turn is committed before scheduling, so transcript order follows
    /// arrival order. A failed commit returns an error and schedules nothing.
    pub async fn handle_inbound(
        &self,
        identity: &BotIdentity,
        message: InboundMessage,
    ) -> Result<InboundDisposition> {
        if let Some(reason) = self.ignore_reason(identity, &message) {
            return Ok(InboundDisposition::Ignored { reason });
        }
        let key = ConversationKey::new(message.sender_id.to_string(), message.chat_id);
        let media_url = self.relay_media(&key, &message).await;
        if message.text.is_empty() && media_url.is_none() {
            return Ok(InboundDisposition::Ignored {
                reason: "no text or usable media",
            });
        }

        let registry = &self.context.registry;
        if !message.text.is_empty() {
            registry.commit(&key.user_id, Turn::user(message.text.clone()))?;
        }
        if let Some(media_url) = media_url {
            registry.set_pending_media(&key, media_url)?;
        }

        let delay = self.delay_policy.sample();
        let context = Arc::clone(&self.context);
        let is_private = message.is_private;
        let scheduled = self.scheduler.schedule(key, delay, move |ticket| async move {
            let key = ticket.key().clone();
            match execute_reply(&context, &ticket, is_private).await {
                Ok(report) => log_reply_report(&key, ticket.generation(), report),
                Err(error) => tracing::warn!(
                    user_id = %key.user_id,
                    chat_id = key.chat_id,
                    generation = ticket.generation(),
                    error = %format!("{error:#}"),
                    "reply job failed"
                ),
            }
        })?;
        Ok(InboundDisposition::Scheduled {
            generation: scheduled.generation,
            delay,
        })
    }

    /// Downloads and relays a photo-like attachment. Failures are logged and
    /// the message continues without media.
    async fn relay_media(&self, key: &ConversationKey, message: &InboundMessage) -> Option<String> {
        let media = message.media.as_ref()?;
        if !media.is_relayable() {
            tracing::info!(
                user_id = %key.user_id,
                chat_id = key.chat_id,
                media_kind = media.kind.as_str(),
                "attachment kept out of the prompt"
            );
            return None;
        }
        let relayed = async {
            let bytes = self
                .context
                .platform
                .download_media(media)
                .await
                .context("failed to download attachment")?;
            self.relay
                .upload(&media.relay_file_name(message.message_id), bytes)
                .await
                .context("failed to relay attachment")
        }
        .await;
        match relayed {
            Ok(url) => Some(url),
            Err(error) => {
                tracing::warn!(
                    user_id = %key.user_id,
                    chat_id = key.chat_id,
                    error = %format!("{error:#}"),
                    "attachment dropped"
                );
                None
            }
        }
    }

    async fn dispatch(&self, identity: &BotIdentity, message: InboundMessage) {
        let sender_id = message.sender_id;
        let chat_id = message.chat_id;
        let chat_label = message.chat_label();
        match self.handle_inbound(identity, message).await {
            Ok(InboundDisposition::Scheduled { generation, delay }) => tracing::debug!(
                sender_id,
                chat_id,
                chat = chat_label,
                generation,
                delay_secs = delay.as_secs_f64(),
                "reply scheduled"
            ),
            Ok(InboundDisposition::Ignored { reason }) => {
                tracing::debug!(sender_id, chat_id, reason, "message ignored")
            }
            Err(error) => tracing::warn!(
                sender_id,
                chat_id,
                error = %format!("{error:#}"),
                "failed to record inbound message"
            ),
        }
    }

    /// Long-polls until `shutdown` resolves, then cancels pending replies.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future,
    {
        let identity = self
            .context
            .platform
            .bot_identity()
            .await
            .context("failed to resolve bot identity")?;
        tracing::info!(
            bot = %identity.display_name(),
            bot_id = identity.id,
            debug_mode = self.debug_mode,
            "bot is online and waiting for messages"
        );

        tokio::pin!(shutdown);
        let mut offset = None;
        loop {
            let polled = tokio::select! {
                _ = &mut shutdown => break,
                polled = self.context.platform.poll_updates(offset) => polled,
            };
            match polled {
                Ok(batch) => {
                    if batch.next_offset.is_some() {
                        offset = batch.next_offset;
                    }
                    for message in batch.messages {
                        self.dispatch(&identity, message).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        error = %format!("{error:#}"),
                        backoff_ms = self.poll_backoff.as_millis() as u64,
                        "update poll failed"
                    );
                    let stopping = tokio::select! {
                        _ = &mut shutdown => true,
                        _ = tokio::time::sleep(self.poll_backoff) => false,
                    };
                    if stopping {
                        break;
                    }
                }
            }
        }

        let cancelled = self.scheduler.cancel_all()?;
        tracing::info!(cancelled_pending_replies = cancelled, "bot stopped");
        Ok(())
    }

    pub async fn run(&self) -> Result<()> {
        self.run_until(tokio::signal::ctrl_c()).await
    }
}

/// Reply job body: permission, prompt, commit, then delivery.
async fn execute_reply(
    context: &ReplyContext,
    ticket: &ReplyTicket,
    is_private: bool,
) -> Result<ReplyJobReport> {
    let key = ticket.key();
    if !context.gate.can_post(key, is_private).await {
        context.registry.take_pending_media(key)?;
        return Ok(ReplyJobReport::PermissionDenied);
    }
    if ticket.is_cancelled() {
        return Ok(ReplyJobReport::ShutdownRequested);
    }

    let media_url = context.registry.take_pending_media(key)?;
    let transcript = context.registry.snapshot(&key.user_id)?;
    let outcome = context
        .pipeline
        .run(key, &transcript, media_url.as_deref())
        .await?;

    if outcome.text.is_empty() && outcome.media_url.is_none() {
        return Ok(ReplyJobReport::NothingToSend);
    }
    if !outcome.text.is_empty() {
        context
            .registry
            .commit(&key.user_id, Turn::assistant(outcome.text.clone()))?;
        context
            .platform
            .send_text(key.chat_id, &outcome.text)
            .await
            .context("failed to send reply")?;
    }

    let mut media_sent = false;
    if let Some(url) = outcome.media_url.as_deref() {
        match context.platform.send_media(key.chat_id, url).await {
            Ok(()) => media_sent = true,
            Err(error) => tracing::warn!(
                user_id = %key.user_id,
                chat_id = key.chat_id,
                error = %format!("{error:#}"),
                "failed to send image"
            ),
        }
    }
    Ok(ReplyJobReport::Delivered {
        text_sent: !outcome.text.is_empty(),
        media_sent,
    })
}

fn log_reply_report(key: &ConversationKey, generation: u64, report: ReplyJobReport) {
    match report {
        ReplyJobReport::PermissionDenied => tracing::info!(
            user_id = %key.user_id,
            chat_id = key.chat_id,
            generation,
            "ignored chat: no permission to send messages"
        ),
        ReplyJobReport::ShutdownRequested => tracing::info!(
            user_id = %key.user_id,
            chat_id = key.chat_id,
            generation,
            "reply abandoned for shutdown"
        ),
        ReplyJobReport::NothingToSend => tracing::info!(
            user_id = %key.user_id,
            chat_id = key.chat_id,
            generation,
            "reply had nothing to send"
        ),
        ReplyJobReport::Delivered {
            text_sent,
            media_sent,
        } => tracing::info!(
            user_id = %key.user_id,
            chat_id = key.chat_id,
            generation,
            text_sent,
            media_sent,
            "message sent in chat"
        ),
    }
}
