//! Speech-to-text stage.
//!
//! The `SpeechBackend` trait decouples the pipeline from any specific engine.
//! Three interchangeable variants are selected by config:
//!
//! | id            | implementation                                   |
//! |---------------|--------------------------------------------------|
//! | `whisper-cpp` | in-process whisper.cpp bindings, beam search     |
//! | `whisper-fast`| same bindings, greedy preset for quantized models|
//! | `stub`        | metadata echo, for tests and dry runs            |
//!
//! If the configured backend fails to load, loading is retried once with the
//! primary (`whisper-cpp`); if that also fails the error is fatal.
//!
//! `Transcriber` owns the backend plus transcript persistence: each
//! successful transcription writes `NNNN.txt` (ISO-8601 timestamp line, then
//! the text) into the output directory and advances a counter that is
//! persisted with a write-then-rename so it stays gap-free across restarts.
//! The input WAV is removed on every exit path.

pub mod stub;

#[cfg(feature = "whisper")]
pub mod whisper_cpp;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::SecondsFormat;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{AuricleError, Result};

pub use stub::StubBackend;

/// Contract for speech recognition backends.
///
/// `&mut self` on `transcribe` intentionally expresses that decoders are
/// stateful; the pipeline serialises all calls through a single worker.
pub trait SpeechBackend: Send {
    /// One-time load: open model files, allocate decoder state.
    ///
    /// # Errors
    /// Returns `AuricleError::BackendLoad` if model files are missing or
    /// corrupt.
    fn load(&mut self) -> Result<()>;

    /// Transcribe a mono 16-bit WAV file into raw text. Empty or
    /// whitespace-only output means no speech was recognised.
    fn transcribe(&mut self, wav_path: &Path) -> Result<String>;

    /// Stable identifier recorded on every transcript.
    fn name(&self) -> &'static str;
}

/// Backend variants selectable via `whisper_backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    WhisperCpp,
    WhisperFast,
    Stub,
}

impl BackendKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "whisper-cpp" | "whisper_cpp" | "whispercpp" => Some(Self::WhisperCpp),
            "whisper-fast" | "whisper_fast" | "whisperfast" => Some(Self::WhisperFast),
            "stub" => Some(Self::Stub),
            _ => None,
        }
    }
}

/// A successful transcription, ready for the queue.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptRecord {
    /// Recognised text, trimmed, non-empty.
    pub text: String,
    /// Path of the persisted transcript file.
    pub file: PathBuf,
    /// ISO-8601 creation time with local offset.
    pub timestamp: String,
    /// Wall time spent in the backend, seconds.
    pub duration: f64,
    /// Backend identifier.
    pub backend: String,
}

fn create_backend(kind: BackendKind, config: &PipelineConfig) -> Result<Box<dyn SpeechBackend>> {
    match kind {
        #[cfg(feature = "whisper")]
        BackendKind::WhisperCpp | BackendKind::WhisperFast => {
            use whisper_cpp::{DecodePreset, WhisperCppBackend};
            let preset = if kind == BackendKind::WhisperCpp {
                DecodePreset::Beam
            } else {
                DecodePreset::Greedy
            };
            Ok(Box::new(WhisperCppBackend::new(
                config.model_path.clone(),
                config.language.clone(),
                config.n_threads,
                preset,
            )))
        }
        #[cfg(not(feature = "whisper"))]
        BackendKind::WhisperCpp | BackendKind::WhisperFast => {
            let _ = config;
            Err(AuricleError::BackendLoad(
                "compiled without whisper feature".into(),
            ))
        }
        BackendKind::Stub => Ok(Box::new(StubBackend::new())),
    }
}

fn try_load(kind: BackendKind, config: &PipelineConfig) -> Result<Box<dyn SpeechBackend>> {
    let mut backend = create_backend(kind, config)?;
    backend.load()?;
    Ok(backend)
}

/// Load the configured backend, retrying once with the primary on failure.
pub fn load_backend(config: &PipelineConfig) -> Result<Box<dyn SpeechBackend>> {
    let requested = BackendKind::parse(&config.whisper_backend);
    if requested.is_none() {
        warn!(
            backend = config.whisper_backend.as_str(),
            "unknown speech backend, using whisper-cpp"
        );
    }
    let kind = requested.unwrap_or(BackendKind::WhisperCpp);

    match try_load(kind, config) {
        Ok(backend) => Ok(backend),
        Err(first) => {
            if kind == BackendKind::WhisperCpp {
                return Err(AuricleError::Config(format!(
                    "speech backend failed to load: {first}"
                )));
            }
            warn!(error = %first, "configured backend failed to load, retrying with whisper-cpp");
            try_load(BackendKind::WhisperCpp, config).map_err(|e| {
                AuricleError::Config(format!("fallback backend failed to load: {e}"))
            })
        }
    }
}

/// Runs the backend and persists transcript files + counter.
pub struct Transcriber {
    backend: Box<dyn SpeechBackend>,
    output_dir: PathBuf,
    counter: u64,
}

const COUNTER_FILE: &str = ".counter";

impl Transcriber {
    /// Build from config: creates the output directory, restores the
    /// persisted counter and loads the backend (with fallback).
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let backend = load_backend(config)?;
        Self::with_backend(config.output_dir.clone(), backend)
    }

    /// Build around an already-loaded backend.
    pub fn with_backend(output_dir: PathBuf, backend: Box<dyn SpeechBackend>) -> Result<Self> {
        fs::create_dir_all(&output_dir)?;
        let counter = load_counter(&output_dir);
        info!(
            backend = backend.name(),
            counter,
            output_dir = %output_dir.display(),
            "transcriber ready"
        );
        Ok(Self {
            backend,
            output_dir,
            counter,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Transcribe one utterance WAV.
    ///
    /// Returns `Ok(None)` when the backend produced empty output (legitimate
    /// silence or noise). The input WAV is removed on every exit path; on
    /// errors the counter is not advanced and the caller drops the record.
    pub fn transcribe_file(&mut self, wav_path: &Path) -> Result<Option<TranscriptRecord>> {
        let started = Instant::now();
        info!(file = %wav_path.display(), "transcribing");

        let outcome = self.backend.transcribe(wav_path);
        cleanup_wav(wav_path);

        let raw = outcome?;
        let text = raw.trim();
        if text.is_empty() {
            info!("no text detected");
            return Ok(None);
        }

        let duration = started.elapsed().as_secs_f64();
        let file = self.save_transcript(text)?;
        info!(
            file = %file.display(),
            duration = format_args!("{duration:.2}"),
            "transcript saved"
        );

        Ok(Some(TranscriptRecord {
            text: text.to_string(),
            file,
            timestamp: local_timestamp(),
            duration,
            backend: self.backend.name().to_string(),
        }))
    }

    fn save_transcript(&mut self, text: &str) -> Result<PathBuf> {
        let next = self.counter + 1;
        let path = self.output_dir.join(format!("{next:04}.txt"));
        let content = format!("{}\n{}\n", local_timestamp(), text);
        fs::write(&path, content)?;
        self.persist_counter(next)?;
        self.counter = next;
        Ok(path)
    }

    // Write-then-rename keeps the counter readable even if we die mid-write.
    fn persist_counter(&self, value: u64) -> Result<()> {
        let tmp = self.output_dir.join(".counter.tmp");
        fs::write(&tmp, value.to_string())?;
        fs::rename(&tmp, self.output_dir.join(COUNTER_FILE))?;
        Ok(())
    }
}

fn load_counter(output_dir: &Path) -> u64 {
    let path = output_dir.join(COUNTER_FILE);
    match fs::read_to_string(&path) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) => v,
            Err(e) => {
                warn!(file = %path.display(), "unreadable transcript counter ({e}), starting at 0");
                0
            }
        },
        Err(_) => 0,
    }
}

fn cleanup_wav(wav_path: &Path) {
    if wav_path.exists() {
        if let Err(e) = fs::remove_file(wav_path) {
            error!(file = %wav_path.display(), "failed to remove audio file: {e}");
        } else {
            debug!(file = %wav_path.display(), "audio file removed");
        }
    }
}

fn local_timestamp() -> String {
    chrono::Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Sorted list of persisted transcript files (dotfiles excluded).
pub fn transcript_files(output_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(output_dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "txt")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    files.sort();
    files
}

/// One-shot snapshot for the `status` subcommand.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptStats {
    pub total_transcripts: usize,
    pub last_counter: u64,
    pub output_dir: String,
}

pub fn transcript_stats(output_dir: &Path) -> TranscriptStats {
    TranscriptStats {
        total_transcripts: transcript_files(output_dir).len(),
        last_counter: load_counter(output_dir),
        output_dir: output_dir.display().to_string(),
    }
}

/// Remove transcript files older than `days`. Returns the removed count.
pub fn cleanup_old_transcripts(output_dir: &Path, days: u64) -> Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    cleanup_transcripts_older_than(output_dir, cutoff)
}

fn cleanup_transcripts_older_than(output_dir: &Path, cutoff: SystemTime) -> Result<usize> {
    let mut removed = 0usize;
    for path in transcript_files(output_dir) {
        let modified = path.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => error!(file = %path.display(), "failed to remove transcript: {e}"),
                }
            }
        }
    }
    if removed > 0 {
        info!(removed, "removed old transcripts");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(dir: &Path, name: &str, samples: usize) -> PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("wav create");
        for _ in 0..samples {
            writer.write_sample(2_000i16).expect("wav write");
        }
        writer.finalize().expect("wav finalize");
        path
    }

    fn stub_transcriber(dir: &Path) -> Transcriber {
        Transcriber::with_backend(dir.to_path_buf(), Box::new(StubBackend::new()))
            .expect("transcriber init")
    }

    #[test]
    fn parses_backend_ids() {
        assert_eq!(BackendKind::parse("whisper-cpp"), Some(BackendKind::WhisperCpp));
        assert_eq!(BackendKind::parse("Whisper_Fast"), Some(BackendKind::WhisperFast));
        assert_eq!(BackendKind::parse("stub"), Some(BackendKind::Stub));
        assert_eq!(BackendKind::parse("faster-whisper"), None);
    }

    #[test]
    fn successful_transcription_writes_file_and_removes_wav() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wav = write_wav(dir.path(), "audio_0001.wav", 4_800);
        let mut transcriber = stub_transcriber(dir.path());

        let record = transcriber
            .transcribe_file(&wav)
            .expect("transcribe")
            .expect("record");

        assert!(!wav.exists(), "input wav should be consumed");
        assert_eq!(transcriber.backend_name(), "stub");
        assert_eq!(record.backend, "stub");
        assert!(record.text.contains("4800 samples"));
        assert!(record.file.ends_with("0001.txt"));

        let content = fs::read_to_string(&record.file).expect("read transcript");
        let mut lines = content.lines();
        let stamp = lines.next().expect("timestamp line");
        assert!(
            chrono::DateTime::parse_from_rfc3339(stamp).is_ok(),
            "first line should be an ISO-8601 timestamp: {stamp}"
        );
        assert_eq!(lines.next(), Some(record.text.as_str()));
    }

    #[test]
    fn empty_output_is_silence_and_advances_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Below the stub's 160-sample floor → empty text.
        let wav = write_wav(dir.path(), "audio_0001.wav", 100);
        let mut transcriber = stub_transcriber(dir.path());

        let record = transcriber.transcribe_file(&wav).expect("transcribe");
        assert!(record.is_none());
        assert!(!wav.exists(), "input wav should still be consumed");
        assert_eq!(transcriber.counter(), 0);
        assert!(transcript_files(dir.path()).is_empty());
    }

    #[test]
    fn counter_survives_restarts_without_gaps() {
        let dir = tempfile::tempdir().expect("tempdir");

        {
            let mut first = stub_transcriber(dir.path());
            let wav = write_wav(dir.path(), "a.wav", 4_800);
            first.transcribe_file(&wav).expect("transcribe").expect("record");
            assert_eq!(first.counter(), 1);
        }

        // New instance simulates a restart.
        let mut second = stub_transcriber(dir.path());
        assert_eq!(second.counter(), 1);
        let wav = write_wav(dir.path(), "b.wav", 4_800);
        let record = second.transcribe_file(&wav).expect("transcribe").expect("record");
        assert!(record.file.ends_with("0002.txt"));
    }

    #[test]
    fn counter_rolls_past_four_digits() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(COUNTER_FILE), "9999").expect("seed counter");
        let mut transcriber = stub_transcriber(dir.path());

        let wav = write_wav(dir.path(), "a.wav", 4_800);
        let record = transcriber
            .transcribe_file(&wav)
            .expect("transcribe")
            .expect("record");
        assert!(record.file.ends_with("10000.txt"));
    }

    #[test]
    fn corrupt_counter_restarts_at_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(COUNTER_FILE), "not a number").expect("seed counter");
        let transcriber = stub_transcriber(dir.path());
        assert_eq!(transcriber.counter(), 0);
    }

    #[test]
    fn cleanup_respects_cutoff_and_skips_dotfiles() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("0001.txt"), "x").expect("write");
        fs::write(dir.path().join("0002.txt"), "y").expect("write");
        fs::write(dir.path().join(COUNTER_FILE), "2").expect("write");

        // Cutoff far in the past → nothing is old enough.
        let removed = cleanup_old_transcripts(dir.path(), 30).expect("cleanup");
        assert_eq!(removed, 0);

        // Cutoff in the future → everything but the dotfile goes.
        let future = SystemTime::now() + Duration::from_secs(60);
        let removed = cleanup_transcripts_older_than(dir.path(), future).expect("cleanup");
        assert_eq!(removed, 2);
        assert!(dir.path().join(COUNTER_FILE).exists());
    }

    #[test]
    fn unknown_backend_falls_back_to_primary_and_reports_fatal_config() {
        // With the whisper feature off (default test build) the primary can't
        // load either, so the fallback path must surface a Config error.
        #[cfg(not(feature = "whisper"))]
        {
            let config = PipelineConfig {
                whisper_backend: "faster-whisper".into(),
                ..PipelineConfig::default()
            };
            let err = load_backend(&config).expect_err("load should fail");
            assert!(matches!(err, AuricleError::Config(_)));
        }
    }

    #[test]
    fn stub_backend_loads_via_config() {
        let config = PipelineConfig {
            whisper_backend: "stub".into(),
            ..PipelineConfig::default()
        };
        let backend = load_backend(&config).expect("stub loads");
        assert_eq!(backend.name(), "stub");
    }
}
