//! Post-processing applied to each synthesized chapter file: optional
//! background-music mixing, quality normalization, and synchronized-lyric
//! embedding.
//!
//! Every step rewrites the file through a temp file in the same directory
//! followed by a rename, so a crash mid-step can never leave a half-written
//! chapter behind. Step failures are logged and swallowed; only synthesis
//! decides a chapter's fate.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use id3::frame::{Content, SynchronisedLyrics, SynchronisedLyricsType, TimestampFormat};
use id3::{Frame, Tag, TagLike, Version};
use rand::thread_rng;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::bgm::BgmPool;
use crate::error::PostProcessError;

const TARGET_BITRATE: &str = "320k";
const TARGET_SAMPLE_RATE: &str = "48000";
/// Language code stored in the synchronized-lyrics frame.
const LYRICS_LANG: &str = "chi";
/// Background track volume relative to the narration at 1.0.
const BGM_VOLUME: &str = "0.25";

/// The post-processing chain for produced chapter audio.
pub struct PostProcessor {
    ffmpeg: Option<std::path::PathBuf>,
    bgm: Option<BgmPool>,
}

impl PostProcessor {
    /// Detect ffmpeg once and take ownership of the optional music pool.
    /// A missing ffmpeg disables the mixing and normalization steps instead
    /// of failing construction.
    pub fn new(bgm: Option<BgmPool>) -> Self {
        let ffmpeg = which_ffmpeg();
        if ffmpeg.is_none() {
            warn!("ffmpeg not found; background mixing and normalization will be skipped");
        }
        Self { ffmpeg, bgm }
    }

    /// Chain with no external tool and no music pool; only the lyric step
    /// does anything.
    #[cfg(test)]
    pub(crate) fn inert() -> Self {
        Self {
            ffmpeg: None,
            bgm: None,
        }
    }

    /// Run the full chain on one produced chapter file. Failures inside any
    /// step are logged and do not propagate.
    pub async fn process(&self, path: &Path, chapter_text: &str) {
        if let Err(e) = self.mix_background_music(path).await {
            warn!(file = %path.display(), error = %e, "background music mixing failed");
        }
        if let Err(e) = self.normalize_quality(path).await {
            warn!(file = %path.display(), error = %e, "quality normalization failed");
        }
        if let Err(e) = self.embed_lyrics(path, chapter_text) {
            warn!(file = %path.display(), error = %e, "lyric embedding failed");
        }
    }

    /// Mix one randomly chosen background track under the narration. The
    /// background loops if shorter and the mix is trimmed to the shorter of
    /// the two inputs, which for a looped background is the narration.
    async fn mix_background_music(&self, path: &Path) -> Result<(), PostProcessError> {
        let Some(pool) = self.bgm.as_ref().filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        let Some(track) = pool.choose(&mut thread_rng()).map(Path::to_path_buf) else {
            return Ok(());
        };
        let ffmpeg = self.ffmpeg.as_deref().ok_or(PostProcessError::FfmpegMissing)?;

        info!(file = %path.display(), track = %track.display(), "mixing background music");
        let scratch = scratch_file(path)?;
        let mut cmd = Command::new(ffmpeg);
        cmd.arg("-y")
            .arg("-i")
            .arg(path)
            .arg("-stream_loop")
            .arg("-1")
            .arg("-i")
            .arg(&track)
            .arg("-filter_complex")
            .arg(format!(
                "[0:a]volume=1.0[a0];[1:a]volume={BGM_VOLUME}[a1];\
                 [a0][a1]amix=inputs=2:duration=shortest[out]"
            ))
            .arg("-map")
            .arg("[out]")
            .arg("-c:a")
            .arg("libmp3lame")
            .arg("-b:a")
            .arg(TARGET_BITRATE)
            .arg(scratch.path());
        run_tool(cmd).await?;
        scratch.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Re-encode to the target bitrate and sample rate, carrying existing
    /// metadata tags over.
    async fn normalize_quality(&self, path: &Path) -> Result<(), PostProcessError> {
        let ffmpeg = self.ffmpeg.as_deref().ok_or(PostProcessError::FfmpegMissing)?;

        info!(file = %path.display(), "normalizing to {TARGET_BITRATE} / {TARGET_SAMPLE_RATE} Hz");
        let scratch = scratch_file(path)?;
        let mut cmd = Command::new(ffmpeg);
        cmd.arg("-y")
            .arg("-i")
            .arg(path)
            .arg("-map_metadata")
            .arg("0")
            .arg("-c:a")
            .arg("libmp3lame")
            .arg("-b:a")
            .arg(TARGET_BITRATE)
            .arg("-ar")
            .arg(TARGET_SAMPLE_RATE)
            .arg(scratch.path());
        run_tool(cmd).await?;
        scratch.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Attach a two-entry synchronized-lyrics frame: the whole chapter text
    /// at the first second and an empty terminator one second before the
    /// end. Any pre-existing SYLT frames are replaced.
    fn embed_lyrics(&self, path: &Path, chapter_text: &str) -> Result<(), PostProcessError> {
        let duration = audio_duration(path)?;
        if duration < Duration::from_secs(1) {
            warn!(file = %path.display(), "audio shorter than one second, skipping lyrics");
            return Ok(());
        }
        let mut tag = match Tag::read_from_path(path) {
            Ok(tag) => tag,
            Err(id3::Error {
                kind: id3::ErrorKind::NoTag,
                ..
            }) => Tag::new(),
            Err(e) => return Err(e.into()),
        };
        tag.remove("SYLT");
        tag.add_frame(Frame::with_content(
            "SYLT",
            Content::SynchronisedLyrics(lyrics_frame(chapter_text, duration)),
        ));

        // Tag a copy, then swap it in.
        let scratch = scratch_file(path)?;
        std::fs::copy(path, scratch.path())?;
        tag.write_to_path(scratch.path(), Version::Id3v24)?;
        scratch.persist(path).map_err(|e| e.error)?;
        debug!(file = %path.display(), "embedded synchronized lyrics");
        Ok(())
    }
}

/// Two-entry synchronized-lyrics frame: the whole chapter text at the first
/// second and an empty terminator one second before the end.
fn lyrics_frame(chapter_text: &str, duration: Duration) -> SynchronisedLyrics {
    let end_ms = duration.as_millis() as u32 - 1_000;
    SynchronisedLyrics {
        lang: LYRICS_LANG.to_string(),
        timestamp_format: TimestampFormat::Ms,
        content_type: SynchronisedLyricsType::Lyrics,
        description: String::new(),
        content: vec![
            (1_000, collapse_whitespace(chapter_text)),
            (end_ms, String::new()),
        ],
    }
}

/// Collapse all runs of whitespace (including newlines) to single spaces.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Duration of the audio at `path`, trusting container metadata when
/// present and otherwise summing packet durations.
pub fn audio_duration(path: &Path) -> Result<Duration, PostProcessError> {
    let file = File::open(path)?;
    let source = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| PostProcessError::NoAudioTrack(path.to_path_buf()))?;
    let track_id = track.id;
    let Some(time_base) = track.codec_params.time_base else {
        return Err(PostProcessError::NoAudioTrack(path.to_path_buf()));
    };

    if let Some(frames) = track.codec_params.n_frames {
        let time = time_base.calc_time(frames);
        return Ok(Duration::from_secs_f64(time.seconds as f64 + time.frac));
    }

    let mut last_ts = 0u64;
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() == track_id {
            last_ts = last_ts.max(packet.ts() + packet.dur());
        }
    }
    let time = time_base.calc_time(last_ts);
    Ok(Duration::from_secs_f64(time.seconds as f64 + time.frac))
}

/// Temp file in the same directory as `path`, so the final rename stays on
/// one filesystem and is atomic.
fn scratch_file(path: &Path) -> Result<NamedTempFile, std::io::Error> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    tempfile::Builder::new()
        .prefix(".epub2mp3-")
        .suffix(".mp3")
        .tempfile_in(dir.unwrap_or_else(|| Path::new(".")))
}

async fn run_tool(mut cmd: Command) -> Result<(), PostProcessError> {
    let output = cmd.stdout(Stdio::null()).stderr(Stdio::piped()).output().await?;
    if !output.status.success() {
        return Err(PostProcessError::Ffmpeg {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn which_ffmpeg() -> Option<std::path::PathBuf> {
    let output = std::process::Command::new("which").arg("ffmpeg").output().ok()?;
    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Some(std::path::PathBuf::from(path))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn whitespace_collapses_to_single_spaces() {
        assert_eq!(
            collapse_whitespace("  line one\nline\ttwo \r\n three  "),
            "line one line two three"
        );
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn lyrics_frame_brackets_the_audio_duration() {
        let frame = lyrics_frame("line one\nline two", Duration::from_secs(90));

        assert_eq!(frame.lang, "chi");
        assert_eq!(frame.timestamp_format, TimestampFormat::Ms);
        assert_eq!(frame.content_type, SynchronisedLyricsType::Lyrics);
        assert_eq!(
            frame.content,
            vec![(1_000, "line one line two".to_string()), (89_000, String::new())]
        );
    }

    #[test]
    fn duration_probe_rejects_non_audio_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.mp3");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(audio_duration(&path).is_err());
    }

    #[test]
    fn scratch_file_shares_the_target_directory() {
        let dir = TempDir::new().unwrap();
        let scratch = scratch_file(&dir.path().join("a.mp3")).unwrap();
        assert_eq!(scratch.path().parent(), Some(dir.path()));
        assert_eq!(
            scratch.path().extension().and_then(|e| e.to_str()),
            Some("mp3")
        );
    }

    #[tokio::test]
    async fn failing_chain_leaves_the_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chapter.mp3");
        std::fs::write(&path, b"synthesized bytes").unwrap();

        // No ffmpeg, and the lyric step fails to probe the fake audio; the
        // original bytes must survive all three steps.
        PostProcessor::inert().process(&path, "some text").await;

        assert_eq!(std::fs::read(&path).unwrap(), b"synthesized bytes");
    }
}
