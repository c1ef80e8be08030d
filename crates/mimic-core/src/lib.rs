//! Foundational low-level utilities shared across mimic crates.
//!
//! Provides the atomic file-write helper used by transcript persistence and
//! the size-based rotation applied to the bot log file.

pub mod atomic_io;
pub mod log_rotation;

pub use atomic_io::write_text_atomic;
pub use log_rotation::{rotate_log_file_if_oversized, LogRotationPolicy};
