//! Text-to-speech synthesis with bounded concurrency, retries with
//! exponential backoff, and a per-attempt timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::SynthesisError;

/// Default wall-clock limit for a single synthesis attempt, including the
/// wait for a concurrency slot.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// External engine that turns text into an audio file at `output`.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        output: &Path,
    ) -> Result<(), SynthesisError>;
}

/// Backend driving the `edge-tts` command-line tool.
pub struct EdgeTtsBackend {
    program: PathBuf,
}

impl EdgeTtsBackend {
    /// Locate `edge-tts` on PATH.
    pub fn detect() -> Result<Self, SynthesisError> {
        let output = std::process::Command::new("which").arg("edge-tts").output();
        match output {
            Ok(out) if out.status.success() => {
                let program = String::from_utf8_lossy(&out.stdout).trim().to_string();
                debug!(program, "found edge-tts");
                Ok(Self {
                    program: PathBuf::from(program),
                })
            }
            _ => Err(SynthesisError::BackendMissing(
                "edge-tts not found. Install it with 'pip install edge-tts'".into(),
            )),
        }
    }
}

#[async_trait]
impl SynthesisBackend for EdgeTtsBackend {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        output: &Path,
    ) -> Result<(), SynthesisError> {
        // kill_on_drop ties the child's lifetime to this attempt: when the
        // attempt timeout drops the future, the process must not keep
        // writing the output file behind the next attempt's back.
        let result = Command::new(&self.program)
            .arg("--voice")
            .arg(voice)
            .arg("--text")
            .arg(text)
            .arg("--write-media")
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(SynthesisError::Backend(stderr.trim().to_string()));
        }
        Ok(())
    }
}

/// Wraps a backend with retries and a shared concurrency limit on outbound
/// synthesis calls. The limiter is injected so independent runs (and tests)
/// never share a slot budget.
#[derive(Clone)]
pub struct RetryingSynthesizer {
    backend: Arc<dyn SynthesisBackend>,
    limiter: Arc<Semaphore>,
    max_retries: u32,
    attempt_timeout: Duration,
}

impl RetryingSynthesizer {
    pub fn new(backend: Arc<dyn SynthesisBackend>, limiter: Arc<Semaphore>, max_retries: u32) -> Self {
        Self {
            backend,
            limiter,
            max_retries,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Synthesize `text` to `output`, retrying on failure.
    ///
    /// Each attempt waits for a limiter slot and runs under the attempt
    /// timeout; a timed-out attempt is retried like any other failure.
    /// Between attempts the wait doubles (1s, 2s, 4s, ...). When all
    /// attempts are spent the error from the last one is returned.
    pub async fn synthesize_with_retry(
        &self,
        text: &str,
        voice: &str,
        output: &Path,
    ) -> Result<(), SynthesisError> {
        let mut last_error = SynthesisError::Backend("no synthesis attempts were made".into());

        for attempt in 1..=self.max_retries {
            info!(
                target_file = %output.display(),
                attempt,
                max = self.max_retries,
                "synthesis attempt"
            );

            let attempt_result = timeout(self.attempt_timeout, async {
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| SynthesisError::Backend("concurrency limiter closed".into()))?;
                debug!(target_file = %output.display(), "acquired synthesis slot");
                self.backend.synthesize(text, voice, output).await
            })
            .await;

            match attempt_result {
                Ok(Ok(())) => {
                    info!(target_file = %output.display(), "synthesis succeeded");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        target_file = %output.display(),
                        attempt,
                        error = %e,
                        "synthesis attempt failed"
                    );
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        target_file = %output.display(),
                        timeout_secs = self.attempt_timeout.as_secs(),
                        "synthesis attempt timed out"
                    );
                    last_error = SynthesisError::Timeout(self.attempt_timeout);
                }
            }

            if attempt < self.max_retries {
                let backoff = Duration::from_secs(1u64 << (attempt - 1));
                info!(
                    target_file = %output.display(),
                    wait_secs = backoff.as_secs(),
                    "waiting before retry"
                );
                sleep(backoff).await;
            }
        }

        warn!(target_file = %output.display(), "all synthesis attempts failed");
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Backend that fails a fixed number of times before succeeding.
    struct FlakyBackend {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl SynthesisBackend for FlakyBackend {
        async fn synthesize(&self, _: &str, _: &str, _: &Path) -> Result<(), SynthesisError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(SynthesisError::Backend(format!("boom {}", call)))
            } else {
                Ok(())
            }
        }
    }

    /// Backend whose calls never complete, to exercise the attempt timeout.
    struct HangingBackend;

    #[async_trait]
    impl SynthesisBackend for HangingBackend {
        async fn synthesize(&self, _: &str, _: &str, _: &Path) -> Result<(), SynthesisError> {
            pending::<()>().await;
            unreachable!()
        }
    }

    fn synthesizer(backend: Arc<dyn SynthesisBackend>, retries: u32) -> RetryingSynthesizer {
        RetryingSynthesizer::new(backend, Arc::new(Semaphore::new(3)), retries)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let backend = Arc::new(FlakyBackend::new(2));
        let synth = synthesizer(backend.clone(), 3);

        let result = synth
            .synthesize_with_retry("text", "voice", Path::new("out.mp3"))
            .await;

        assert!(result.is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_error_after_exact_attempt_count() {
        let backend = Arc::new(FlakyBackend::new(u32::MAX));
        let synth = synthesizer(backend.clone(), 3);

        let err = synth
            .synthesize_with_retry("text", "voice", Path::new("out.mp3"))
            .await
            .unwrap_err();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "TTS backend failed: boom 3");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_between_attempts() {
        let backend = Arc::new(FlakyBackend::new(u32::MAX));
        let synth = synthesizer(backend, 4);

        let start = Instant::now();
        let _ = synth
            .synthesize_with_retry("text", "voice", Path::new("out.mp3"))
            .await;

        // Attempts are instant; only the 1s + 2s + 4s backoff sleeps advance
        // the paused clock. No sleep after the final attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_classified_and_retried() {
        let synth = synthesizer(Arc::new(HangingBackend), 2)
            .with_attempt_timeout(Duration::from_secs(30));

        let start = Instant::now();
        let err = synth
            .synthesize_with_retry("text", "voice", Path::new("out.mp3"))
            .await
            .unwrap_err();

        assert!(matches!(err, SynthesisError::Timeout(_)));
        // 30s timeout, 1s backoff, 30s timeout.
        assert_eq!(start.elapsed(), Duration::from_secs(61));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_attempt_kills_the_backend_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("slow-tts.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 2\ntouch \"$6\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = Arc::new(EdgeTtsBackend { program: script });
        let synth = RetryingSynthesizer::new(backend, Arc::new(Semaphore::new(1)), 1)
            .with_attempt_timeout(Duration::from_millis(200));

        let out = dir.path().join("out.mp3");
        let err = synth
            .synthesize_with_retry("text", "voice", &out)
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Timeout(_)));

        // Long enough for a leaked process to reach its write.
        sleep(Duration::from_millis(2_500)).await;
        assert!(!out.exists(), "timed-out attempt left its process running");
    }

    /// Backend that records the high-water mark of concurrent calls.
    struct CountingBackend {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SynthesisBackend for CountingBackend {
        async fn synthesize(&self, _: &str, _: &str, _: &Path) -> Result<(), SynthesisError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_synthesis_calls_never_exceed_the_limit() {
        let backend = Arc::new(CountingBackend {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let synth = RetryingSynthesizer::new(backend.clone(), Arc::new(Semaphore::new(2)), 1);

        let mut handles = Vec::new();
        for i in 0..8 {
            let synth = synth.clone();
            handles.push(tokio::spawn(async move {
                synth
                    .synthesize_with_retry("text", "voice", Path::new(&format!("{i}.mp3")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }
}
