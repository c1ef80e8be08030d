use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

fn parse_chat_id(value: &str) -> Result<i64, String> {
    let parsed = value
        .trim()
        .parse::<i64>()
        .map_err(|error| format!("failed to parse chat id: {error}"))?;
    if parsed == 0 {
        return Err("chat id must be non-zero".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "mimic-bot",
    about = "Persona chat bot that answers Telegram messages with a human-like delay",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "MIMIC_CONFIG",
        default_value = "config.json",
        help = "Path to the JSON settings document"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "MIMIC_PERSONA",
        default_value = "personality_prompt.json",
        help = "Path to the persona document (system prompt and user profile)"
    )]
    pub persona: PathBuf,

    #[arg(
        long,
        env = "MIMIC_DEBUG",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Force debug mode: reply immediately and mirror logs to the console"
    )]
    pub debug: bool,

    #[arg(
        long = "telegram-bot-token",
        env = "MIMIC_TELEGRAM_BOT_TOKEN",
        hide_env_values = true,
        help = "Overrides telegram_bot_token from the settings document"
    )]
    pub telegram_bot_token: Option<String>,

    #[arg(
        long = "openai-api-key",
        env = "MIMIC_OPENAI_API_KEY",
        hide_env_values = true,
        help = "Overrides openai_api_key from the settings document"
    )]
    pub openai_api_key: Option<String>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

impl Cli {
    pub fn command(&self) -> CliCommand {
        self.command.clone().unwrap_or(CliCommand::Run)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CliCommand {
    /// Serve conversations until interrupted (default).
    Run,
    /// Verify credentials: print the bot identity, optionally greet a chat and watch traffic.
    Probe(ProbeArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ProbeArgs {
    #[arg(
        long = "chat-id",
        value_parser = parse_chat_id,
        allow_negative_numbers = true,
        help = "Chat that receives a greeting message"
    )]
    pub chat_id: Option<i64>,

    #[arg(long, help = "Log incoming messages without replying until Ctrl-C")]
    pub watch: bool,
}
