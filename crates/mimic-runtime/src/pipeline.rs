//! Reply pipeline: prompt assembly, one completion call, directive extraction and image lookup.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use mimic_ai::{ChatRequest, LlmClient, Message};
use mimic_transcript::Turn;

use crate::directive::{parse_reply_directive, ReplyDirective};
use crate::image_search::ImageSearch;
use crate::persona::Profile;
use crate::scheduler::ConversationKey;

#[derive(Debug, Clone, PartialEq, Eq)]
/// What the caller should record and deliver.
pub struct ReplyOutcome {
    /// Reply text with any directive removed. May be empty.
    pub text: String,
    /// Image found for the directive's query, if any.
    pub media_url: Option<String>,
}

pub struct ReplyPipeline {
    client: Arc<dyn LlmClient>,
    model: String,
    profile: Arc<Profile>,
    image_search: Option<Arc<dyn ImageSearch>>,
}

impl ReplyPipeline {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
        profile: Arc<Profile>,
        image_search: Option<Arc<dyn ImageSearch>>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            profile,
            image_search,
        }
    }

    /// System turn, profile turn, transcript without its leading system turn,
    /// then the pending image if there is one.
    pub fn build_prompt(&self, transcript: &[Turn], media_url: Option<&str>) -> Vec<Message> {
        let history = match transcript.first() {
            Some(first) if first.is_system() => &transcript[1..],
            _ => transcript,
        };
        let mut messages = Vec::with_capacity(history.len().saturating_add(3));
        messages.push(Message::from(&self.profile.system_turn()));
        messages.push(Message::from(&self.profile.profile_turn()));
        messages.extend(history.iter().map(Message::from));
        if let Some(media_url) = media_url {
            messages.push(Message::from(&Turn::user_image(media_url)));
        }
        messages
    }

    pub async fn run(
        &self,
        key: &ConversationKey,
        transcript: &[Turn],
        media_url: Option<&str>,
    ) -> Result<ReplyOutcome> {
        let request = ChatRequest::new(self.model.clone(), self.build_prompt(transcript, media_url));
        let response = self
            .client
            .complete(request)
            .await
            .context("completion request failed")?;
        let reply = response.message.text_content().trim().to_string();
        if reply.is_empty() {
            bail!("completion returned an empty reply");
        }
        tracing::info!(
            user_id = %key.user_id,
            chat_id = key.chat_id,
            reply_chars = reply.chars().count(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "generated reply"
        );
        tracing::debug!(user_id = %key.user_id, reply = %reply, "reply text");

        match parse_reply_directive(&reply) {
            ReplyDirective::PlainText { text } => Ok(ReplyOutcome {
                text,
                media_url: None,
            }),
            ReplyDirective::DirectiveFound { text, query } => {
                let media_url = self.lookup_image(key, &query).await;
                Ok(ReplyOutcome { text, media_url })
            }
        }
    }

    async fn lookup_image(&self, key: &ConversationKey, query: &str) -> Option<String> {
        let Some(image_search) = &self.image_search else {
            tracing::debug!(
                user_id = %key.user_id,
                query,
                "image directive dropped: no image search configured"
            );
            return None;
        };
        match image_search.search(query).await {
            Ok(Some(url)) => {
                tracing::info!(user_id = %key.user_id, query, url = %url, "image found");
                Some(url)
            }
            Ok(None) => {
                tracing::info!(user_id = %key.user_id, query, "image search found nothing");
                None
            }
            Err(error) => {
                tracing::warn!(
                    user_id = %key.user_id,
                    query,
                    error = %format!("{error:#}"),
                    "image search failed"
                );
                None
            }
        }
    }
}
