//! `StubBackend` — placeholder backend that echoes metadata without real
//! inference.
//!
//! Lets the full capture → queue → send pipeline be exercised end-to-end
//! without model files, and serves as the deterministic backend for tests
//! and the `test` subcommand.

use std::path::Path;

use tracing::debug;

use crate::error::{AuricleError, Result};
use crate::transcribe::SpeechBackend;

/// Echo-style stub backend.
///
/// For every WAV of non-trivial length it returns
/// `"[stub: <N> samples @ <SR> Hz]"`; near-empty files produce empty output
/// (treated as silence by the transcriber).
#[derive(Debug, Default)]
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SpeechBackend for StubBackend {
    fn load(&mut self) -> Result<()> {
        debug!("StubBackend::load — no-op");
        Ok(())
    }

    fn transcribe(&mut self, wav_path: &Path) -> Result<String> {
        let reader = hound::WavReader::open(wav_path)
            .map_err(|e| AuricleError::Transcription(format!("wav open: {e}")))?;
        let spec = reader.spec();
        let samples = reader.len();

        if samples < 160 {
            return Ok(String::new());
        }

        Ok(format!("[stub: {} samples @ {} Hz]", samples, spec.sample_rate))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}
