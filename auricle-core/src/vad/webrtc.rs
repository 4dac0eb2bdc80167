//! WebRTC voice activity detector.
//!
//! Wraps the reference GMM classifier from the WebRTC project. It accepts
//! mono 16-bit PCM frames of exactly 10/20/30 ms at 8/16/32/48 kHz and maps
//! the 0–3 aggressiveness scale onto the four operating modes.

use webrtc_vad::{SampleRate, Vad, VadMode};

use super::{VadDecision, VoiceActivityDetector};
use crate::error::{AuricleError, Result};

pub struct WebRtcVad {
    vad: Vad,
    aggressiveness: u8,
    sample_rate: u32,
}

fn mode_for(aggressiveness: u8) -> VadMode {
    match aggressiveness {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

fn rate_for(sample_rate: u32) -> Result<SampleRate> {
    match sample_rate {
        8_000 => Ok(SampleRate::Rate8kHz),
        16_000 => Ok(SampleRate::Rate16kHz),
        32_000 => Ok(SampleRate::Rate32kHz),
        48_000 => Ok(SampleRate::Rate48kHz),
        other => Err(AuricleError::Config(format!(
            "sample rate {other} not supported by the WebRTC classifier"
        ))),
    }
}

impl WebRtcVad {
    pub fn new(aggressiveness: u8, sample_rate: u32) -> Result<Self> {
        let rate = rate_for(sample_rate)?;
        let vad = Vad::new_with_rate_and_mode(rate, mode_for(aggressiveness));
        Ok(Self {
            vad,
            aggressiveness,
            sample_rate,
        })
    }
}

impl VoiceActivityDetector for WebRtcVad {
    fn classify(&mut self, frame: &[i16]) -> VadDecision {
        match self.vad.is_voice_segment(frame) {
            Ok(true) => VadDecision::Speech,
            Ok(false) => VadDecision::Silence,
            Err(()) => {
                // The classifier rejects frames that are not 10/20/30 ms.
                tracing::warn!(
                    frame_len = frame.len(),
                    sample_rate = self.sample_rate,
                    "classifier rejected frame length, treating as silence"
                );
                VadDecision::Silence
            }
        }
    }

    fn reset(&mut self) {
        // The classifier keeps no cross-utterance state worth preserving;
        // rebuilding is the documented way to return it to a known state.
        if let Ok(rate) = rate_for(self.sample_rate) {
            self.vad = Vad::new_with_rate_and_mode(rate, mode_for(self.aggressiveness));
        }
    }
}
