//! EPUB → per-chapter MP3 audiobook conversion pipeline.
//!
//! Chapters are extracted from the EPUB spine, synthesized concurrently
//! through Edge TTS (bounded by a semaphore, with retries and per-attempt
//! timeouts), then each produced file is post-processed in place: optional
//! background-music mixing, quality normalization, and synchronized-lyric
//! embedding.

pub mod audio;
pub mod bgm;
pub mod convert;
pub mod document;
pub mod error;
pub mod tts;

pub use convert::{Config, Converter, RunReport};
pub use error::ConvertError;
