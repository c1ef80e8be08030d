use std::sync::Arc;

use anyhow::{Context, Result};
use mimic_ai::{LlmClient, OpenAiClient, OpenAiConfig};
use mimic_cli::Cli;
use mimic_runtime::{
    BotConfig, ConversationRegistry, ConversationRuntime, ConversationRuntimeConfig, ImageSearch,
    MessagingPlatform, Profile, ReplyPipeline, TelegramApiClient, TmpFilesRelay,
    UnsplashImageSearch, DEFAULT_POLL_BACKOFF,
};
use mimic_transcript::TranscriptStore;

/// Settings document plus command-line overrides, validated.
pub(crate) fn load_bot_config(cli: &Cli) -> Result<BotConfig> {
    let mut config = BotConfig::read(&cli.config)?;
    apply_cli_overrides(cli, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_cli_overrides(cli: &Cli, config: &mut BotConfig) {
    if let Some(token) = cli
        .telegram_bot_token
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        config.telegram_bot_token = token.to_string();
    }
    if let Some(api_key) = cli
        .openai_api_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        config.openai_api_key = api_key.to_string();
    }
    if cli.debug {
        config.debug_mode = true;
    }
}

pub(crate) fn build_telegram_client(config: &BotConfig) -> Result<TelegramApiClient> {
    TelegramApiClient::new(
        &config.telegram_api_base,
        &config.telegram_bot_token,
        config.request_timeout_ms,
        config.poll_timeout_seconds,
    )
}

pub(crate) fn build_runtime(cli: &Cli, config: &BotConfig) -> Result<ConversationRuntime> {
    let profile = Arc::new(Profile::load(&cli.persona)?);

    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "failed to create state directory {}",
            config.state_dir.display()
        )
    })?;
    let store = TranscriptStore::load(config.history_path(), profile.system_turn())?;
    let registry = Arc::new(ConversationRegistry::new(
        store,
        config.transcript_capacity(),
    ));

    let client: Arc<dyn LlmClient> = Arc::new(
        OpenAiClient::new(OpenAiConfig {
            api_base: config.openai_api_base.clone(),
            api_key: config.openai_api_key.clone(),
            request_timeout_ms: config.request_timeout_ms,
        })
        .context("failed to create completion client")?,
    );
    let image_search = match &config.image_search {
        Some(image_search) => Some(Arc::new(UnsplashImageSearch::new(
            image_search,
            config.request_timeout_ms,
        )?) as Arc<dyn ImageSearch>),
        None => None,
    };
    let pipeline = Arc::new(ReplyPipeline::new(
        client,
        config.openai_model.clone(),
        profile,
        image_search,
    ));

    let platform: Arc<dyn MessagingPlatform> = Arc::new(build_telegram_client(config)?);
    let relay = Arc::new(TmpFilesRelay::new(
        &config.media_relay_base,
        config.request_timeout_ms,
    )?);

    Ok(ConversationRuntime::new(ConversationRuntimeConfig {
        platform,
        relay,
        pipeline,
        registry,
        delay_policy: config.delay_policy(),
        debug_mode: config.debug_mode,
        owner_user_id: config.owner_user_id,
        poll_backoff: DEFAULT_POLL_BACKOFF,
    }))
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use mimic_cli::Cli;
    use serde_json::json;
    use tempfile::tempdir;

    use super::{build_runtime, load_bot_config};

    fn write_documents(dir: &std::path::Path) -> (String, String) {
        let config = dir.join("config.json");
        let persona = dir.join("personality_prompt.json");
        std::fs::write(
            &config,
            json!({
                "telegram_bot_token": "",
                "openai_api_key": "sk-file",
                "openai_model": "gpt-4o-mini",
                "state_dir": dir.join("state"),
                "log_file": dir.join("bot.log")
            })
            .to_string(),
        )
        .expect("write config");
        std::fs::write(
            &persona,
            json!({"system_prompt": "You are Mira.", "user_profile": {}}).to_string(),
        )
        .expect("write persona");
        (
            config.display().to_string(),
            persona.display().to_string(),
        )
    }

    #[test]
    fn functional_cli_overrides_fill_secrets_before_validation() {
        let temp = tempdir().expect("tempdir");
        let (config_path, persona_path) = write_documents(temp.path());

        let cli = Cli::try_parse_from(["mimic-bot", "--config", config_path.as_str()])
            .expect("parse");
        let error = load_bot_config(&cli).expect_err("blank token must fail");
        assert!(error.to_string().contains("telegram_bot_token"));

        let cli = Cli::try_parse_from([
            "mimic-bot",
            "--config",
            config_path.as_str(),
            "--persona",
            persona_path.as_str(),
            "--telegram-bot-token",
            "123:abc",
            "--debug",
        ])
        .expect("parse");
        let config = load_bot_config(&cli).expect("load");
        assert_eq!(config.telegram_bot_token, "123:abc");
        assert_eq!(config.openai_api_key, "sk-file");
        assert!(config.debug_mode);
    }

    #[test]
    fn integration_build_runtime_creates_state_dir_and_empty_registry() {
        let temp = tempdir().expect("tempdir");
        let (config_path, persona_path) = write_documents(temp.path());
        let cli = Cli::try_parse_from([
            "mimic-bot",
            "--config",
            config_path.as_str(),
            "--persona",
            persona_path.as_str(),
            "--telegram-bot-token",
            "123:abc",
        ])
        .expect("parse");
        let config = load_bot_config(&cli).expect("load");

        let runtime = build_runtime(&cli, &config).expect("runtime");
        assert!(temp.path().join("state").is_dir());
        let transcript = runtime.registry().snapshot("42").expect("snapshot");
        assert_eq!(transcript.len(), 1);
        assert!(transcript[0].is_system());
    }
}
