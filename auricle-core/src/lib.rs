//! # auricle-core
//!
//! Continuous speech-capture-and-forward pipeline.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → FrameReader → Segmenter
//!                                                                │
//!                                                        audio_NNNN.wav
//!                                                                │
//!                                                    Transcriber (worker)
//!                                                                │
//!                                               TranscriptQueue (SQLite)
//!                                                                │
//!                                        Sender ──▶ POST {api_url}  ◀── connectivity probe
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens on the capture
//! and worker threads; delivery runs on the async runtime. The queue is the
//! only shared mutable state and survives restarts, including items caught
//! mid-send by a crash.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod agent;
pub mod audio;
pub mod config;
pub mod error;
pub mod queue;
pub mod segment;
pub mod sender;
pub mod transcribe;
pub mod vad;

// Convenience re-exports for downstream crates
pub use agent::PipelineAgent;
pub use config::{AuthHeader, PipelineConfig};
pub use error::AuricleError;
pub use queue::{ItemStatus, QueueItem, QueueStats, TranscriptQueue};
pub use segment::{Segmenter, Utterance};
pub use sender::{Sender, SenderConfig, SenderStatus};
pub use transcribe::{SpeechBackend, Transcriber, TranscriptRecord};
pub use vad::{VadDecision, VoiceActivityDetector};
