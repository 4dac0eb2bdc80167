//! Voice Activity Detection (VAD) abstraction.
//!
//! The `VoiceActivityDetector` trait is the primary extensibility point:
//! swap in `WebRtcVad` (default), `EnergyVad` (fallback), or any future
//! neural VAD without touching the segmenter.
//!
//! Implementations are deliberately not required to be `Send`: the native
//! classifier state is bound to the capture thread, so detectors are
//! constructed inside that thread, the same way the capture stream is.

pub mod energy;

#[cfg(feature = "vad-webrtc")]
pub mod webrtc;

#[cfg(feature = "vad-webrtc")]
pub use webrtc::WebRtcVad;

pub use energy::EnergyVad;

use tracing::info;

/// Whether a given PCM frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The frame contains speech.
    Speech,
    /// The frame is silent (or below threshold, including hangover period).
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful (hangover counters, native decoder state).
pub trait VoiceActivityDetector {
    /// Classify one mono 16-bit PCM frame at the rate this detector was
    /// configured for. Frame length must match the configured frame duration.
    fn classify(&mut self, frame: &[i16]) -> VadDecision;

    /// Reset any internal state (e.g. hangover counters) between utterances.
    fn reset(&mut self);
}

/// Construct the configured classifier, falling back to `EnergyVad` when the
/// native one cannot be initialised.
pub fn build_detector(aggressiveness: u8, sample_rate: u32) -> Box<dyn VoiceActivityDetector> {
    #[cfg(feature = "vad-webrtc")]
    {
        match WebRtcVad::new(aggressiveness, sample_rate) {
            Ok(v) => {
                info!(aggressiveness, sample_rate, "using WebRTC VAD");
                return Box::new(v);
            }
            Err(e) => {
                tracing::warn!("WebRTC VAD init failed ({e}), falling back to EnergyVad");
            }
        }
    }

    let _ = sample_rate;
    info!(aggressiveness, "using energy VAD");
    Box::new(EnergyVad::from_aggressiveness(aggressiveness))
}
