use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, MediaSource, Message,
    MessageRole, MimicAiError,
};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
/// Public struct `OpenAiConfig` used across mimic components.
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone)]
/// Chat-completions client. Every call is a single attempt; callers decide
/// what a failure means for them.
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, MimicAiError> {
        if config.api_key.trim().is_empty() {
            return Err(MimicAiError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|e| {
                MimicAiError::InvalidResponse(format!("invalid API key header: {e}"))
            })?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()?;

        Ok(Self { client, config })
    }

    fn chat_completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }

        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, MimicAiError> {
        let body = build_chat_request_body(&request);
        let response = self
            .client
            .post(self.chat_completions_url())
            .header("x-mimic-request-id", new_request_id())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(MimicAiError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }
        parse_chat_response(&raw)
    }
}

fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("mimic-{millis}-{count}")
}

fn build_chat_request_body(request: &ChatRequest) -> Value {
    let messages = request
        .messages
        .iter()
        .map(to_openai_message)
        .collect::<Vec<_>>();
    json!({
        "model": request.model,
        "messages": messages,
    })
}

fn to_openai_message(message: &Message) -> Value {
    match message.role {
        MessageRole::User => json!({
            "role": "user",
            "content": to_openai_user_content(message),
        }),
        role => json!({
            "role": role.as_str(),
            "content": message.text_content(),
        }),
    }
}

fn to_openai_user_content(message: &Message) -> Value {
    if !message.has_media() {
        return Value::String(message.text_content());
    }

    let parts = message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if text.trim().is_empty() => None,
            ContentBlock::Text { text } => Some(json!({
                "type": "text",
                "text": text,
            })),
            ContentBlock::Image {
                source: MediaSource::Url { url },
            } => Some(json!({
                "type": "image_url",
                "image_url": { "url": url },
            })),
        })
        .collect::<Vec<_>>();
    Value::Array(parts)
}

fn parse_chat_response(raw: &str) -> Result<ChatResponse, MimicAiError> {
    let parsed: OpenAiChatResponse = serde_json::from_str(raw)?;
    let choice =
        parsed.choices.into_iter().next().ok_or_else(|| {
            MimicAiError::InvalidResponse("response contained no choices".to_string())
        })?;

    let content = parse_openai_content_blocks(&choice.message.content);
    let usage = parsed
        .usage
        .map(|usage| ChatUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        message: Message {
            role: MessageRole::Assistant,
            content,
        },
        finish_reason: choice.finish_reason,
        usage,
    })
}

fn parse_openai_content_blocks(content: &Option<Value>) -> Vec<ContentBlock> {
    match content {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(text)) => {
            if text.trim().is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::Text { text: text.clone() }]
            }
        }
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.as_object())
            .filter_map(parse_openai_array_part)
            .collect(),
        Some(other) => vec![ContentBlock::Text {
            text: other.to_string(),
        }],
    }
}

fn parse_openai_array_part(part: &serde_json::Map<String, Value>) -> Option<ContentBlock> {
    if part.get("type").and_then(Value::as_str) == Some("image_url") {
        return part
            .get("image_url")
            .and_then(|image| image.get("url").or(Some(image)))
            .and_then(Value::as_str)
            .map(ContentBlock::image_url);
    }

    let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
    if text.trim().is_empty() {
        None
    } else {
        Some(ContentBlock::Text {
            text: text.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::{build_chat_request_body, parse_chat_response, OpenAiClient, OpenAiConfig};
    use crate::{ChatRequest, ContentBlock, LlmClient, Message, MessageRole, MimicAiError};

    fn test_config(api_base: String) -> OpenAiConfig {
        OpenAiConfig {
            api_base,
            api_key: "test-openai-key".to_string(),
            request_timeout_ms: 5_000,
        }
    }

    #[test]
    fn unit_serializes_user_image_turn_as_multipart_content() {
        let request = ChatRequest::new(
            "gpt-4o-mini",
            vec![
                Message::system("You are Mira."),
                Message::user("hi"),
                Message {
                    role: MessageRole::User,
                    content: vec![ContentBlock::image_url("https://tmpfiles.org/dl/1/a.jpg")],
                },
            ],
        );

        let body = build_chat_request_body(&request);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "You are Mira.");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["messages"][2]["content"][0]["type"], "image_url");
        assert_eq!(
            body["messages"][2]["content"][0]["image_url"]["url"],
            "https://tmpfiles.org/dl/1/a.jpg"
        );
        assert_eq!(
            body.as_object().map(|object| object.len()),
            Some(2),
            "only model and messages are sent"
        );
    }

    #[test]
    fn unit_parses_string_and_array_content() {
        let raw = r#"{
            "choices": [{"message": {"content": "  hello there  "}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 14}
        }"#;
        let response = parse_chat_response(raw).expect("response must parse");
        assert_eq!(response.message.text_content(), "  hello there  ");
        assert_eq!(response.usage.total_tokens, 14);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));

        let raw = r#"{
            "choices": [{"message": {"content": [
                {"type":"text","text":"caption"},
                {"type":"image_url","image_url":{"url":"https://example.com/cat.png"}}
            ]}, "finish_reason": null}]
        }"#;
        let response = parse_chat_response(raw).expect("array content must parse");
        assert_eq!(response.message.text_content(), "caption");
        assert!(response.message.has_media());
    }

    #[test]
    fn regression_empty_choices_is_invalid_response() {
        let error = parse_chat_response(r#"{"choices": []}"#).expect_err("must fail");
        assert!(matches!(error, MimicAiError::InvalidResponse(_)));

        let error = parse_chat_response("not json").expect_err("must fail");
        assert!(matches!(error, MimicAiError::Serde(_)));
    }

    #[test]
    fn regression_blank_api_key_is_rejected() {
        let mut config = test_config("https://api.openai.com/v1".to_string());
        config.api_key = "   ".to_string();
        assert!(matches!(
            OpenAiClient::new(config),
            Err(MimicAiError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn integration_client_posts_chat_completion_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer test-openai-key")
                .header_exists("x-mimic-request-id")
                .json_body_includes(
                    json!({
                        "model": "gpt-4o-mini",
                        "messages": [{"role": "system"}, {"role": "user"}],
                    })
                    .to_string(),
                );
            then.status(200).json_body(json!({
                "choices": [{"message": {"content": "openai ok"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
            }));
        });

        let client = OpenAiClient::new(test_config(format!("{}/v1", server.base_url())))
            .expect("client");
        let response = client
            .complete(ChatRequest::new(
                "gpt-4o-mini",
                vec![Message::system("system"), Message::user("hello")],
            ))
            .await
            .expect("completion should succeed");

        mock.assert();
        assert_eq!(response.message.text_content(), "openai ok");
        assert_eq!(response.usage.total_tokens, 8);
    }

    #[tokio::test]
    async fn regression_rate_limit_is_single_attempt_http_status_error() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429).body("slow down");
        });

        let client = OpenAiClient::new(test_config(format!("{}/v1", server.base_url())))
            .expect("client");
        let error = client
            .complete(ChatRequest::new("gpt-4o-mini", vec![Message::user("hi")]))
            .await
            .expect_err("429 must fail");

        mock.assert_calls(1);
        match error {
            MimicAiError::HttpStatus { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
