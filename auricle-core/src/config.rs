//! Pipeline configuration.
//!
//! All knobs recognized by the pipeline, with their defaults. The app crate
//! is responsible for populating this from the environment / a config file;
//! core only validates and consumes it.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuricleError, Result};

/// How the API credential is transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthHeader {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `X-API-Key: <token>`
    ApiKey,
}

/// Configuration for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target endpoint for transcript delivery. Without it the pipeline
    /// still captures and queues; the dispatcher idles.
    pub api_url: Option<String>,
    /// Credential sent with every request, per `auth_header`.
    pub api_token: Option<String>,
    pub auth_header: AuthHeader,

    /// Speech backend: `whisper-cpp` (default), `whisper-fast`, or `stub`.
    pub whisper_backend: String,
    pub model_path: PathBuf,
    pub model_name: String,
    pub language: String,
    pub n_threads: u32,

    /// Capture + VAD rate (Hz). Must be one of 8000/16000/32000/48000.
    pub sample_rate: u32,
    /// PCM frame length in ms. The classifier accepts 10/20/30.
    pub frame_duration_ms: u32,
    /// Classifier strictness, 0 (lenient) to 3 (aggressive).
    pub vad_aggressiveness: u8,
    /// Trailing-silence cutoff that finalizes an utterance.
    pub silence_duration_ms: u32,
    /// Floor for emitted utterance length; shorter segments are discarded.
    pub min_recording_duration_ms: u32,

    /// Connectivity prober period (seconds).
    pub connectivity_check_interval: u64,
    /// Dispatcher period (seconds).
    pub send_check_interval: u64,
    /// HTTP deadline per request (seconds).
    pub request_timeout: u64,
    /// Send attempts before an item becomes permanently failed.
    pub max_retries: u32,
    /// Backoff bounds (seconds): delay(n) = min(base · 2^(n-1), max).
    pub base_retry_delay: u64,
    pub max_retry_delay: u64,
    pub max_concurrent_sends: usize,

    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            auth_header: AuthHeader::Bearer,

            whisper_backend: "whisper-cpp".into(),
            model_path: PathBuf::from("./models/ggml-base.en.bin"),
            model_name: "base.en".into(),
            language: "en".into(),
            n_threads: 4,

            sample_rate: 16_000,
            frame_duration_ms: 30,
            vad_aggressiveness: 2,
            silence_duration_ms: 1_000,
            min_recording_duration_ms: 500,

            connectivity_check_interval: 5,
            send_check_interval: 2,
            request_timeout: 10,
            max_retries: 5,
            base_retry_delay: 1,
            max_retry_delay: 300,
            max_concurrent_sends: 3,

            temp_dir: PathBuf::from("./data/temp"),
            output_dir: PathBuf::from("./data/transcripts"),
            queue_dir: PathBuf::from("./data/queue"),
            log_dir: PathBuf::from("./logs"),
        }
    }
}

impl PipelineConfig {
    /// Samples per PCM frame at the configured rate.
    pub fn chunk_size(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Reject combinations the classifier or the backoff math cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.sample_rate, 8_000 | 16_000 | 32_000 | 48_000) {
            return Err(AuricleError::Config(format!(
                "unsupported sample_rate {} (expected 8000/16000/32000/48000)",
                self.sample_rate
            )));
        }
        if !matches!(self.frame_duration_ms, 10 | 20 | 30) {
            return Err(AuricleError::Config(format!(
                "unsupported frame_duration_ms {} (expected 10/20/30)",
                self.frame_duration_ms
            )));
        }
        if self.vad_aggressiveness > 3 {
            return Err(AuricleError::Config(format!(
                "vad_aggressiveness {} out of range 0-3",
                self.vad_aggressiveness
            )));
        }
        if self.silence_duration_ms < self.frame_duration_ms {
            return Err(AuricleError::Config(
                "silence_duration_ms must be at least one frame".into(),
            ));
        }
        if self.max_concurrent_sends == 0 {
            return Err(AuricleError::Config(
                "max_concurrent_sends must be at least 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(AuricleError::Config("max_retries must be at least 1".into()));
        }
        Ok(())
    }
}
