//! `probe` command: credential check and passive traffic watch.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mimic_cli::ProbeArgs;
use mimic_runtime::{BotConfig, BotIdentity, InboundMessage, MessagingPlatform};

use crate::bootstrap::build_telegram_client;

const PROBE_GREETING: &str = "Hello from mimic!";

pub(crate) async fn run_probe(config: &BotConfig, args: &ProbeArgs) -> Result<()> {
    let client = build_telegram_client(config)?;
    probe_with(&client, args, tokio::signal::ctrl_c()).await
}

async fn probe_with<F>(platform: &dyn MessagingPlatform, args: &ProbeArgs, shutdown: F) -> Result<()>
where
    F: std::future::Future,
{
    let identity = platform
        .bot_identity()
        .await
        .context("failed to resolve bot identity")?;
    tracing::info!(
        bot = %identity.display_name(),
        bot_id = identity.id,
        "logged in"
    );
    println!("logged in as {} ({})", identity.display_name(), identity.id);

    if let Some(chat_id) = args.chat_id {
        platform
            .send_text(chat_id, PROBE_GREETING)
            .await
            .with_context(|| format!("failed to send test message to chat {chat_id}"))?;
        tracing::info!(chat_id, "sent test message");
    }

    if !args.watch {
        return Ok(());
    }
    tracing::info!("watching incoming messages; press Ctrl-C to stop");
    tokio::pin!(shutdown);
    let mut offset = None;
    loop {
        let polled = tokio::select! {
            _ = &mut shutdown => break,
            polled = platform.poll_updates(offset) => polled,
        };
        let batch = polled.context("failed to poll updates")?;
        if batch.next_offset.is_some() {
            offset = batch.next_offset;
        }
        for message in &batch.messages {
            tracing::info!("{}", render_watch_line(&identity, message));
        }
    }
    Ok(())
}

fn render_watch_line(identity: &BotIdentity, message: &InboundMessage) -> String {
    let sent_at = DateTime::<Utc>::from_timestamp(message.sent_at_unix, 0)
        .map(|sent_at| sent_at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown time".to_string());
    let media = message
        .media
        .as_ref()
        .map(|media| format!("<{}>", media.kind.as_str()));
    let body = match (message.text.is_empty(), media) {
        (_, None) => message.text.clone(),
        (true, Some(media)) => media,
        (false, Some(media)) => format!("{} {media}", message.text),
    };
    let direction = if message.sender_id == identity.id {
        "bot".to_string()
    } else {
        format!("from {}", message.sender_id)
    };
    format!(
        "[{}] [{sent_at}] chat {} {direction}: {body}",
        message.chat_label(),
        message.chat_id
    )
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex, time::Duration};

    use anyhow::{anyhow, Result};
    use mimic_cli::ProbeArgs;
    use mimic_runtime::{
        BotIdentity, InboundMessage, MediaAttachment, MediaKind, MessagingPlatform, PolledUpdates,
    };

    use super::{probe_with, render_watch_line, PROBE_GREETING};

    struct ProbePlatform {
        sent: Mutex<Vec<(i64, String)>>,
        polls: Mutex<VecDeque<PolledUpdates>>,
    }

    #[async_trait::async_trait]
    impl MessagingPlatform for ProbePlatform {
        async fn bot_identity(&self) -> Result<BotIdentity> {
            Ok(identity())
        }

        async fn poll_updates(&self, _offset: Option<i64>) -> Result<PolledUpdates> {
            let next = self.polls.lock().expect("lock").pop_front();
            match next {
                Some(batch) => Ok(batch),
                None => std::future::pending().await,
            }
        }

        async fn download_media(&self, _media: &MediaAttachment) -> Result<Vec<u8>> {
            Err(anyhow!("unused"))
        }

        async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
            self.sent.lock().expect("lock").push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_media(&self, _chat_id: i64, _url: &str) -> Result<()> {
            Err(anyhow!("unused"))
        }

        async fn send_permission(&self, _chat_id: i64) -> Result<bool> {
            Ok(true)
        }
    }

    fn identity() -> BotIdentity {
        BotIdentity {
            id: 999,
            first_name: "Mira".to_string(),
            username: None,
        }
    }

    fn message(sender_id: i64, chat_id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            update_id: 1,
            message_id: 1,
            sender_id,
            chat_id,
            is_private: chat_id > 0,
            sent_at_unix: 1_700_000_000,
            text: text.to_string(),
            media: None,
        }
    }

    #[test]
    fn unit_watch_line_labels_chat_kind_sender_and_media() {
        assert_eq!(
            render_watch_line(&identity(), &message(42, 42, "hi")),
            "[private] [2023-11-14 22:13:20] chat 42 from 42: hi"
        );
        let mut group = message(999, -100, "");
        group.media = Some(MediaAttachment {
            kind: MediaKind::Photo,
            file_id: "p".to_string(),
            file_name: None,
        });
        assert_eq!(
            render_watch_line(&identity(), &group),
            "[group] [2023-11-14 22:13:20] chat -100 bot: <photo>"
        );
        group.text = "look".to_string();
        assert_eq!(
            render_watch_line(&identity(), &group),
            "[group] [2023-11-14 22:13:20] chat -100 bot: look <photo>"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn functional_probe_greets_chat_and_watches_until_shutdown() {
        let platform = ProbePlatform {
            sent: Mutex::new(Vec::new()),
            polls: Mutex::new(VecDeque::from([PolledUpdates {
                next_offset: Some(2),
                messages: vec![message(42, 42, "ping")],
            }])),
        };
        probe_with(
            &platform,
            &ProbeArgs {
                chat_id: Some(42),
                watch: true,
            },
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await
        .expect("probe");

        assert_eq!(
            *platform.sent.lock().expect("lock"),
            vec![(42, PROBE_GREETING.to_string())]
        );
        assert!(platform.polls.lock().expect("lock").is_empty());
    }
}
