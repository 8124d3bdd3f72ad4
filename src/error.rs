use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Fatal, document-level failures. Per-chapter problems never surface here;
/// they are caught inside the chapter task and collected into the report.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("EPUB file not found: {0}")]
    DocumentNotFound(PathBuf),
    #[error("failed to read EPUB: {0}")]
    Epub(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single synthesis attempt. All variants are retryable.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("conversion timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    BackendMissing(String),
    #[error("TTS backend failed: {0}")]
    Backend(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures inside the post-processing chain. These are logged per step and
/// never change a chapter's outcome.
#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("ffmpeg is not installed")]
    FfmpegMissing,
    #[error("ffmpeg exited with {status}: {stderr}")]
    Ffmpeg { status: ExitStatus, stderr: String },
    #[error("no audio track found in {0}")]
    NoAudioTrack(PathBuf),
    #[error("tag error: {0}")]
    Tag(#[from] id3::Error),
    #[error("decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
