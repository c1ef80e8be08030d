//! Per-user conversation transcripts with bounded length and whole-file persistence.
//!
//! Every transcript starts with exactly one system turn. The store is the
//! single writer of the persisted document, which maps user ids to their turns.

mod store;
mod turn;

pub use store::{TranscriptError, TranscriptStore};
pub use turn::{ContentPart, ImageReference, Turn, TurnContent, TurnRole};
