use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use mimic_core::write_text_atomic;
use thiserror::Error;

use crate::Turn;

#[derive(Debug, Error)]
/// Enumerates supported `TranscriptError` values.
pub enum TranscriptError {
    #[error("failed to read transcript store {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse transcript store {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize transcript store: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to persist transcript store {}: {message}", .path.display())]
    Persist { path: PathBuf, message: String },
    #[error("system turns are seeded by the store and cannot be appended")]
    SystemTurnAppend,
}

#[derive(Debug)]
/// Ordered per-user transcripts backed by one JSON document.
pub struct TranscriptStore {
    path: PathBuf,
    system_turn: Turn,
    transcripts: BTreeMap<String, Vec<Turn>>,
}

impl TranscriptStore {
    /// Creates an empty store that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>, system_turn: Turn) -> Self {
        Self {
            path: path.into(),
            system_turn,
            transcripts: BTreeMap::new(),
        }
    }

    /// Loads the persisted document, tolerating its absence.
    ///
    /// Stored transcripts are re-seeded with `system_turn` so that persona edits
    /// take effect for existing conversations.
    pub fn load(path: impl Into<PathBuf>, system_turn: Turn) -> Result<Self, TranscriptError> {
        let path = path.into();
        let mut store = Self::new(path.clone(), system_turn);
        if !path.exists() {
            return Ok(store);
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| TranscriptError::Read {
            path: path.clone(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(store);
        }
        let transcripts = serde_json::from_str::<BTreeMap<String, Vec<Turn>>>(&raw)
            .map_err(|source| TranscriptError::Parse {
                path: path.clone(),
                source,
            })?;
        for (user_id, turns) in transcripts {
            let reseeded = store.reseed(turns);
            store.transcripts.insert(user_id, reseeded);
        }
        tracing::info!(
            path = %path.display(),
            conversations = store.transcripts.len(),
            "conversation history loaded"
        );
        Ok(store)
    }

    fn reseed(&self, turns: Vec<Turn>) -> Vec<Turn> {
        let mut reseeded = Vec::with_capacity(turns.len().saturating_add(1));
        reseeded.push(self.system_turn.clone());
        reseeded.extend(turns.into_iter().filter(|turn| !turn.is_system()));
        reseeded
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn system_turn(&self) -> &Turn {
        &self.system_turn
    }

    pub fn transcript(&self, user_id: &str) -> Option<&[Turn]> {
        self.transcripts.get(user_id).map(Vec::as_slice)
    }

    pub fn len(&self, user_id: &str) -> usize {
        self.transcripts.get(user_id).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.transcripts.is_empty()
    }

    pub fn conversation_count(&self) -> usize {
        self.transcripts.len()
    }

    /// Adds `turn` to the end of the user's transcript, seeding it with the
    /// system turn first when absent. Returns the new transcript length.
    pub fn append(&mut self, user_id: &str, turn: Turn) -> Result<usize, TranscriptError> {
        if turn.is_system() {
            return Err(TranscriptError::SystemTurnAppend);
        }
        let transcript = self
            .transcripts
            .entry(user_id.to_string())
            .or_insert_with(|| vec![self.system_turn.clone()]);
        transcript.push(turn);
        Ok(transcript.len())
    }

    /// Keeps the system turn plus the most recent `max_len - 1` turns.
    /// Returns true when turns were dropped.
    pub fn trim(&mut self, user_id: &str, max_len: usize) -> bool {
        let max_len = max_len.max(1);
        let Some(transcript) = self.transcripts.get_mut(user_id) else {
            return false;
        };
        if transcript.len() <= max_len {
            return false;
        }
        let keep_from = transcript.len() - (max_len - 1);
        let mut trimmed = Vec::with_capacity(max_len);
        trimmed.push(self.system_turn.clone());
        trimmed.extend(transcript.drain(keep_from..));
        *transcript = trimmed;
        true
    }

    /// Writes the whole store via temp file + rename.
    pub fn persist(&self) -> Result<(), TranscriptError> {
        let mut payload =
            serde_json::to_string_pretty(&self.transcripts).map_err(TranscriptError::Serialize)?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload).map_err(|error| TranscriptError::Persist {
            path: self.path.clone(),
            message: format!("{error:#}"),
        })?;
        tracing::debug!(path = %self.path.display(), "conversation history saved");
        Ok(())
    }

    /// Commit point: append, enforce capacity, then persist the whole store.
    ///
    /// The in-memory transcript keeps the turn even when persisting fails.
    pub fn commit(
        &mut self,
        user_id: &str,
        turn: Turn,
        max_len: usize,
    ) -> Result<usize, TranscriptError> {
        self.append(user_id, turn)?;
        self.trim(user_id, max_len);
        self.persist()?;
        Ok(self.len(user_id))
    }
}
