//! Whisper.cpp speech backend via in-process `whisper-rs` bindings.
//!
//! Two presets share this implementation:
//! - `whisper-cpp`: beam-search decoding, the accuracy-oriented default.
//! - `whisper-fast`: greedy single-pass decoding, intended for quantized
//!   models where throughput matters more than the last word-error point.
//!
//! whisper.cpp expects mono f32 samples at 16 kHz and degrades badly on very
//! short inputs, so anything under ~1.2 s is padded with trailing silence
//! before decoding.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState};

use crate::error::{AuricleError, Result};
use crate::transcribe::SpeechBackend;

/// Minimum decode window: 1.2 s at 16 kHz.
const MIN_DECODE_SAMPLES: usize = 16_000 * 12 / 10;

/// Decoding preset selected by the backend id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePreset {
    /// Beam search (`whisper-cpp`).
    Beam,
    /// Greedy, single pass (`whisper-fast`).
    Greedy,
}

pub struct WhisperCppBackend {
    model_path: PathBuf,
    language: String,
    n_threads: i32,
    preset: DecodePreset,
    state: Option<WhisperState>,
}

impl WhisperCppBackend {
    pub fn new(model_path: PathBuf, language: String, n_threads: u32, preset: DecodePreset) -> Self {
        Self {
            model_path,
            language,
            n_threads: n_threads.max(1) as i32,
            preset,
            state: None,
        }
    }

    fn read_samples(wav_path: &Path) -> Result<Vec<f32>> {
        let mut reader = hound::WavReader::open(wav_path)
            .map_err(|e| AuricleError::Transcription(format!("wav open: {e}")))?;
        let spec = reader.spec();
        if spec.channels != 1 || spec.bits_per_sample != 16 {
            return Err(AuricleError::Transcription(format!(
                "expected mono 16-bit wav, got {} ch / {} bit",
                spec.channels, spec.bits_per_sample
            )));
        }
        let mut samples: Vec<f32> = Vec::with_capacity(reader.len() as usize);
        for sample in reader.samples::<i16>() {
            let s = sample.map_err(|e| AuricleError::Transcription(format!("wav read: {e}")))?;
            samples.push(f32::from(s) / 32768.0);
        }
        if samples.len() < MIN_DECODE_SAMPLES {
            samples.resize(MIN_DECODE_SAMPLES, 0.0);
        }
        Ok(samples)
    }
}

impl SpeechBackend for WhisperCppBackend {
    fn load(&mut self) -> Result<()> {
        if !self.model_path.exists() {
            return Err(AuricleError::BackendLoad(format!(
                "model file not found: {}",
                self.model_path.display()
            )));
        }
        let path = self.model_path.to_string_lossy();
        let context = WhisperContext::new_with_params(&path, WhisperContextParameters::default())
            .map_err(|e| AuricleError::BackendLoad(format!("whisper context: {e}")))?;
        let state = context
            .create_state()
            .map_err(|e| AuricleError::BackendLoad(format!("whisper state: {e}")))?;
        self.state = Some(state);
        info!(model = %self.model_path.display(), preset = ?self.preset, "whisper model loaded");
        Ok(())
    }

    fn transcribe(&mut self, wav_path: &Path) -> Result<String> {
        let samples = Self::read_samples(wav_path)?;

        let strategy = match self.preset {
            DecodePreset::Beam => SamplingStrategy::BeamSearch {
                beam_size: 5,
                patience: -1.0,
            },
            DecodePreset::Greedy => SamplingStrategy::Greedy { best_of: 1 },
        };
        let mut params = FullParams::new(strategy);
        params.set_n_threads(self.n_threads);
        if self.language != "auto" {
            // Borrows self.language; disjoint from the state borrow below.
            params.set_language(Some(self.language.as_str()));
        }
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| AuricleError::BackendLoad("whisper model not loaded".into()))?;

        state
            .full(params, &samples)
            .map_err(|e| AuricleError::Transcription(format!("whisper decode: {e}")))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            if let Ok(piece) = segment.to_str() {
                if !piece.trim().is_empty() {
                    text.push_str(piece);
                    text.push(' ');
                }
            }
        }

        debug!(samples = samples.len(), chars = text.len(), "decode complete");
        Ok(text.trim().to_string())
    }

    fn name(&self) -> &'static str {
        match self.preset {
            DecodePreset::Beam => "whisper-cpp",
            DecodePreset::Greedy => "whisper-fast",
        }
    }
}
