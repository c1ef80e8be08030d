use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mimic_ai::{ChatRequest, ChatResponse, ChatUsage, LlmClient, Message, MimicAiError};
use mimic_runtime::{
    BotIdentity, ConversationKey, ConversationRegistry, ConversationRuntime,
    ConversationRuntimeConfig, DelayPolicy, ImageSearch, InboundDisposition, InboundMessage,
    MediaAttachment, MediaRelay, MessagingPlatform, PolledUpdates, Profile, ReplyPipeline,
    SlotState,
};
use mimic_transcript::{TranscriptStore, Turn};
use serde_json::{json, Map};
use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;

const SYSTEM_PROMPT: &str = "You are Mira, a laid-back barista.";

struct ScriptedClient {
    responses: AsyncMutex<VecDeque<String>>,
    requests: AsyncMutex<Vec<ChatRequest>>,
    latency: Duration,
}

impl ScriptedClient {
    fn new(responses: Vec<&str>, latency: Duration) -> Self {
        Self {
            responses: AsyncMutex::new(responses.into_iter().map(str::to_string).collect()),
            requests: AsyncMutex::new(Vec::new()),
            latency,
        }
    }

    async fn request_texts(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|request| request.messages.iter().map(Message::text_content).collect())
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, MimicAiError> {
        self.requests.lock().await.push(request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let Some(reply) = self.responses.lock().await.pop_front() else {
            return Err(MimicAiError::InvalidResponse(
                "scripted client has no remaining responses".to_string(),
            ));
        };
        Ok(ChatResponse {
            message: Message::assistant_text(reply),
            finish_reason: Some("stop".to_string()),
            usage: ChatUsage::default(),
        })
    }
}

#[derive(Default)]
struct ChatPlatform {
    sent_text: Mutex<Vec<(i64, String)>>,
    sent_media: Mutex<Vec<(i64, String)>>,
    group_permission: Mutex<Option<bool>>,
}

impl ChatPlatform {
    fn sent_text(&self) -> Vec<(i64, String)> {
        self.sent_text.lock().expect("lock").clone()
    }

    fn sent_media(&self) -> Vec<(i64, String)> {
        self.sent_media.lock().expect("lock").clone()
    }
}

#[async_trait]
impl MessagingPlatform for ChatPlatform {
    async fn bot_identity(&self) -> Result<BotIdentity> {
        Ok(identity())
    }

    async fn poll_updates(&self, _offset: Option<i64>) -> Result<PolledUpdates> {
        std::future::pending().await
    }

    async fn download_media(&self, media: &MediaAttachment) -> Result<Vec<u8>> {
        Ok(media.file_id.as_bytes().to_vec())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        self.sent_text
            .lock()
            .expect("lock")
            .push((chat_id, text.to_string()));
        Ok(())
    }

    async fn send_media(&self, chat_id: i64, url: &str) -> Result<()> {
        self.sent_media
            .lock()
            .expect("lock")
            .push((chat_id, url.to_string()));
        Ok(())
    }

    async fn send_permission(&self, _chat_id: i64) -> Result<bool> {
        (*self.group_permission.lock().expect("lock"))
            .ok_or_else(|| anyhow!("chat member lookup failed"))
    }
}

struct LocalRelay;

#[async_trait]
impl MediaRelay for LocalRelay {
    async fn upload(&self, file_name: &str, _bytes: Vec<u8>) -> Result<String> {
        Ok(format!("https://relay.test/dl/7/{file_name}"))
    }
}

struct CatalogImageSearch;

#[async_trait]
impl ImageSearch for CatalogImageSearch {
    async fn search(&self, query: &str) -> Result<Option<String>> {
        Ok(Some(format!(
            "https://images.test/{}.jpg",
            query.replace(' ', "-")
        )))
    }
}

struct BotFixture {
    temp: TempDir,
    platform: Arc<ChatPlatform>,
    client: Arc<ScriptedClient>,
    runtime: ConversationRuntime,
}

impl BotFixture {
    fn history_path(&self) -> PathBuf {
        history_path(self.temp.path())
    }
}

fn history_path(root: &Path) -> PathBuf {
    root.join("state").join("conversation_history.json")
}

fn identity() -> BotIdentity {
    BotIdentity {
        id: 999,
        first_name: "Mira".to_string(),
        username: Some("mira_bot".to_string()),
    }
}

fn profile() -> Arc<Profile> {
    let mut user_profile = Map::new();
    user_profile.insert("city".to_string(), json!("Lisbon"));
    Arc::new(Profile {
        system_prompt: SYSTEM_PROMPT.to_string(),
        user_profile,
    })
}

fn fixture(client: ScriptedClient, delay: Duration, image_search: bool) -> BotFixture {
    let temp = tempfile::tempdir().expect("tempdir");
    let profile = profile();
    let store = TranscriptStore::load(history_path(temp.path()), profile.system_turn())
        .expect("load store");
    let platform = Arc::new(ChatPlatform::default());
    let client = Arc::new(client);
    let image_search =
        image_search.then(|| Arc::new(CatalogImageSearch) as Arc<dyn ImageSearch>);
    let runtime = ConversationRuntime::new(ConversationRuntimeConfig {
        platform: platform.clone(),
        relay: Arc::new(LocalRelay),
        pipeline: Arc::new(ReplyPipeline::new(
            client.clone(),
            "gpt-4o-mini",
            profile,
            image_search,
        )),
        registry: Arc::new(ConversationRegistry::new(store, 20)),
        delay_policy: DelayPolicy::Uniform {
            min: delay,
            max: delay,
        },
        debug_mode: false,
        owner_user_id: None,
        poll_backoff: Duration::from_millis(10),
    });
    BotFixture {
        temp,
        platform,
        client,
        runtime,
    }
}

fn text_message(sender_id: i64, chat_id: i64, text: &str) -> InboundMessage {
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

async fn deliver(fixture: &BotFixture, message: InboundMessage) -> InboundDisposition {
    fixture
        .runtime
        .handle_inbound(&identity(), message)
        .await
        .expect("handle inbound")
}

#[tokio::test(start_paused = true)]
async fn integration_burst_across_two_users_yields_one_persisted_reply_each() {
    let fixture = fixture(
        ScriptedClient::new(vec!["reply for first", "reply for second"], Duration::ZERO),
        Duration::from_secs(30),
        false,
    );

    for text in ["morning", "are you open", "need coffee"] {
        deliver(&fixture, text_message(42, 42, text)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        deliver(&fixture, text_message(77, 77, &format!("{text}?"))).await;
        tokio::time::sleep(Duration::from_secs(4)).await;
    }
    assert!(fixture.platform.sent_text().is_empty());
    tokio::time::sleep(Duration::from_secs(60)).await;

    let mut sent = fixture.platform.sent_text();
    sent.sort();
    assert_eq!(
        sent,
        vec![
            (42, "reply for first".to_string()),
            (77, "reply for second".to_string())
        ]
    );
    let requests = fixture.client.request_texts().await;
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request[0], SYSTEM_PROMPT);
        assert_eq!(request[1], r#"User profile info: {"city":"Lisbon"}"#);
        assert_eq!(request.len(), 5);
    }

    let reloaded = TranscriptStore::load(fixture.history_path(), Turn::system("Updated persona"))
        .expect("reload");
    let first = reloaded.transcript("42").expect("user 42");
    assert_eq!(first[0], Turn::system("Updated persona"));
    assert_eq!(
        first[1..]
            .iter()
            .map(Turn::text_content)
            .collect::<Vec<_>>(),
        vec!["morning", "are you open", "need coffee", "reply for first"]
    );
    assert_eq!(reloaded.len("77"), 5);
}

#[tokio::test(start_paused = true)]
async fn integration_running_reply_is_not_cancelled_by_later_message() {
    let fixture = fixture(
        ScriptedClient::new(vec!["first answer", "second answer"], Duration::from_secs(20)),
        Duration::from_secs(30),
        false,
    );
    let key = ConversationKey::new("42", 42);

    deliver(&fixture, text_message(42, 42, "first question")).await;
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(fixture.runtime.scheduler().slot_state(&key), SlotState::Running);

    let disposition = deliver(&fixture, text_message(42, 42, "second question")).await;
    assert!(matches!(
        disposition,
        InboundDisposition::Scheduled { generation: 2, .. }
    ));
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(
        fixture.platform.sent_text(),
        vec![(42, "first answer".to_string())]
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        fixture.platform.sent_text(),
        vec![
            (42, "first answer".to_string()),
            (42, "second answer".to_string())
        ]
    );
    let requests = fixture.client.request_texts().await;
    assert_eq!(&requests[0][2..], ["first question"]);
    assert_eq!(
        &requests[1][2..],
        ["first question", "second question", "first answer"]
    );
    assert_eq!(fixture.runtime.scheduler().slot_state(&key), SlotState::Idle);
}

#[tokio::test(start_paused = true)]
async fn integration_image_directive_sends_cleaned_text_then_photo() {
    let fixture = fixture(
        ScriptedClient::new(
            vec![r#"Look at this {"fetch_image": {"query": "latte art"}} cute right?"#],
            Duration::ZERO,
        ),
        Duration::from_secs(1),
        true,
    );

    deliver(&fixture, text_message(42, 42, "show me something nice")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        fixture.platform.sent_text(),
        vec![(42, "Look at this cute right?".to_string())]
    );
    assert_eq!(
        fixture.platform.sent_media(),
        vec![(42, "https://images.test/latte-art.jpg".to_string())]
    );
    let transcript = fixture.runtime.registry().snapshot("42").expect("snapshot");
    assert_eq!(
        transcript.last(),
        Some(&Turn::assistant("Look at this cute right?"))
    );
}

#[tokio::test(start_paused = true)]
async fn integration_group_without_confirmed_permission_never_calls_the_model() {
    let fixture = fixture(
        ScriptedClient::new(vec!["unused"], Duration::ZERO),
        Duration::from_secs(1),
        false,
    );

    deliver(&fixture, text_message(42, -100_500, "hello group")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    *fixture.platform.group_permission.lock().expect("lock") = Some(false);
    deliver(&fixture, text_message(42, -100_500, "still there?")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(fixture.client.request_texts().await.is_empty());
    assert!(fixture.platform.sent_text().is_empty());
    assert_eq!(
        fixture.runtime.registry().snapshot("42").expect("snapshot").len(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn regression_failed_persistence_schedules_nothing() {
    let fixture = fixture(
        ScriptedClient::new(vec!["unused"], Duration::ZERO),
        Duration::from_secs(1),
        false,
    );
    std::fs::create_dir_all(fixture.history_path()).expect("block history path");

    let error = fixture
        .runtime
        .handle_inbound(&identity(), text_message(42, 42, "hi"))
        .await
        .expect_err("commit must fail");
    assert!(format!("{error:#}").contains("failed to commit turn"));
    assert_eq!(
        fixture
            .runtime
            .scheduler()
            .slot_state(&ConversationKey::new("42", 42)),
        SlotState::Idle
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(fixture.client.request_texts().await.is_empty());
}
