//! Batch coordination: one concurrent task per chapter, a shared synthesis
//! limit, and a final report of failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::audio::PostProcessor;
use crate::bgm::BgmPool;
use crate::document::{extract_chapters, Chapter};
use crate::error::ConvertError;
use crate::tts::{RetryingSynthesizer, SynthesisBackend};

/// Batch-level settings, one instance per run.
#[derive(Debug, Clone)]
pub struct Config {
    pub voice: String,
    pub output_dir: PathBuf,
    /// Maximum simultaneous synthesis calls across the whole batch.
    pub max_concurrent: usize,
    /// Attempts per chapter before it is reported as failed.
    pub max_retries: u32,
    pub bgm_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            voice: "zh-CN-YunxiaNeural".to_string(),
            output_dir: PathBuf::from("output_audio"),
            max_concurrent: 3,
            max_retries: 3,
            bgm_dir: None,
        }
    }
}

/// Terminal state of one chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterStatus {
    /// Output already existed with non-zero size; no work performed.
    Skipped,
    Done,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ChapterOutcome {
    pub index: usize,
    pub title: String,
    pub status: ChapterStatus,
}

/// Final collection of per-chapter outcomes, in chapter order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<ChapterOutcome>,
}

impl RunReport {
    /// Indices of chapters whose synthesis failed, ascending.
    pub fn failed_indices(&self) -> Vec<usize> {
        let mut failed: Vec<usize> = self
            .outcomes
            .iter()
            .filter(|o| matches!(o.status, ChapterStatus::Failed(_)))
            .map(|o| o.index)
            .collect();
        failed.sort_unstable();
        failed
    }

    pub fn completed(&self) -> usize {
        self.count(|s| *s == ChapterStatus::Done)
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| *s == ChapterStatus::Skipped)
    }

    fn count(&self, pred: impl Fn(&ChapterStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// Drives the whole batch: enumerates chapters, fans out one task per
/// chapter, and collects outcomes without ever short-circuiting.
pub struct Converter {
    config: Config,
    synthesizer: RetryingSynthesizer,
    post: Arc<PostProcessor>,
}

impl Converter {
    /// Build a converter around an injected synthesis backend. Each
    /// converter gets its own concurrency limiter.
    pub fn new(config: Config, backend: Arc<dyn SynthesisBackend>) -> Result<Self, ConvertError> {
        let bgm = match &config.bgm_dir {
            Some(dir) => Some(BgmPool::load(dir)?),
            None => None,
        };
        let limiter = Arc::new(Semaphore::new(config.max_concurrent));
        let synthesizer = RetryingSynthesizer::new(backend, limiter, config.max_retries);
        let post = Arc::new(PostProcessor::new(bgm));
        Ok(Self {
            config,
            synthesizer,
            post,
        })
    }

    /// Convert every chapter of `epub_path` into the output directory.
    pub async fn run(&self, epub_path: &Path) -> Result<RunReport, ConvertError> {
        if !epub_path.exists() {
            return Err(ConvertError::DocumentNotFound(epub_path.to_path_buf()));
        }

        let chapters = extract_chapters(epub_path)?;
        info!(chapters = chapters.len(), "extracted chapters");
        std::fs::create_dir_all(&self.config.output_dir)?;

        self.convert_chapters(chapters).await
    }

    /// Launch one task per chapter, then wait for every one of them. A
    /// failing chapter never cancels its siblings; a panicked task is
    /// recorded as that chapter's failure.
    pub async fn convert_chapters(&self, chapters: Vec<Chapter>) -> Result<RunReport, ConvertError> {
        let progress = ProgressBar::new(chapters.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}/{len:3} chapters")
        {
            progress.set_style(style);
        }

        let mut handles = Vec::with_capacity(chapters.len());
        for chapter in chapters {
            let index = chapter.index;
            let title = chapter.title.clone();
            let output_path = self.config.output_dir.join(chapter.file_name());
            let voice = self.config.voice.clone();
            let synthesizer = self.synthesizer.clone();
            let post = Arc::clone(&self.post);
            let progress = progress.clone();

            let handle = tokio::spawn(async move {
                let outcome =
                    convert_chapter(chapter, &voice, &output_path, &synthesizer, &post).await;
                progress.inc(1);
                outcome
            });
            handles.push((index, title, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, title, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(index, error = %e, "chapter task panicked");
                    outcomes.push(ChapterOutcome {
                        index,
                        title,
                        status: ChapterStatus::Failed(e.to_string()),
                    });
                }
            }
        }
        progress.finish_and_clear();

        outcomes.sort_by_key(|o| o.index);
        Ok(RunReport { outcomes })
    }
}

/// One chapter end to end: skip check, synthesis with retries, then the
/// post-processing chain. Only a synthesis failure marks the chapter failed.
async fn convert_chapter(
    chapter: Chapter,
    voice: &str,
    output_path: &Path,
    synthesizer: &RetryingSynthesizer,
    post: &PostProcessor,
) -> ChapterOutcome {
    info!(index = chapter.index, title = %chapter.title, "processing chapter");

    if already_converted(output_path) {
        info!(index = chapter.index, "output already exists, skipping");
        return ChapterOutcome {
            index: chapter.index,
            title: chapter.title,
            status: ChapterStatus::Skipped,
        };
    }

    match synthesizer
        .synthesize_with_retry(&chapter.content, voice, output_path)
        .await
    {
        Ok(()) => {
            post.process(output_path, &chapter.content).await;
            info!(index = chapter.index, title = %chapter.title, "chapter converted");
            ChapterOutcome {
                index: chapter.index,
                title: chapter.title,
                status: ChapterStatus::Done,
            }
        }
        Err(e) => {
            error!(
                index = chapter.index,
                title = %chapter.title,
                error = %e,
                "chapter conversion failed"
            );
            ChapterOutcome {
                index: chapter.index,
                title: chapter.title,
                status: ChapterStatus::Failed(e.to_string()),
            }
        }
    }
}

/// A previous run's output counts as done only if it is non-empty. Content
/// validity is not checked.
fn already_converted(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
