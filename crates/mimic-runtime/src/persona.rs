//! Persona document: the system prompt and the profile context injected into every prompt.

use std::path::Path;

use anyhow::{bail, Context, Result};
use mimic_transcript::Turn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Read-only persona context shared by every conversation.
pub struct Profile {
    pub system_prompt: String,
    #[serde(default)]
    pub user_profile: Map<String, Value>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read persona {}", path.display()))?;
        let profile = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("failed to parse persona {}", path.display()))?;
        if profile.system_prompt.trim().is_empty() {
            bail!("persona field 'system_prompt' cannot be empty");
        }
        Ok(profile)
    }

    pub fn system_turn(&self) -> Turn {
        Turn::system(self.system_prompt.clone())
    }

    pub fn profile_turn(&self) -> Turn {
        let rendered = Value::Object(self.user_profile.clone()).to_string();
        Turn::user(format!("User profile info: {rendered}"))
    }
}
