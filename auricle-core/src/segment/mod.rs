//! Utterance segmentation.
//!
//! Consumes fixed-size PCM frames, classifies each with the VAD, and emits
//! bounded WAV utterances on speech→silence transitions.
//!
//! ## State machine
//!
//! ```text
//!            speech frame                     K consecutive
//!  ┌──────┐ ───────────────▶ ┌───────────┐   silence frames   finalize
//!  │ Idle │                  │ Recording │ ─────────────────▶ (emit/discard)
//!  └──────┘ ◀─────────────── └───────────┘
//! ```
//!
//! While idle, the last `K = silence_duration / frame_duration` frames are
//! kept in a pre-roll ring so the acoustic onset preceding the first
//! VAD-positive frame is not clipped. While recording, every frame (speech
//! and short silences) is appended; once `K` consecutive silence frames have
//! accumulated the segment is finalized. Segments whose speech span (capture
//! minus pre-roll minus the trailing silence window) is shorter than
//! `min_recording_duration_ms` are discarded.
//!
//! Hysteresis comes entirely from the buffer geometry; the classifier itself
//! is per-frame and stateless from the segmenter's point of view.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::audio::FrameSource;
use crate::config::PipelineConfig;
use crate::error::{AuricleError, Result};
use crate::vad::VoiceActivityDetector;

/// Segmentation parameters, derived from the pipeline config.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub silence_duration_ms: u32,
    pub min_recording_duration_ms: u32,
    pub temp_dir: PathBuf,
}

impl SegmenterConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Self {
        Self {
            sample_rate: cfg.sample_rate,
            frame_duration_ms: cfg.frame_duration_ms,
            silence_duration_ms: cfg.silence_duration_ms,
            min_recording_duration_ms: cfg.min_recording_duration_ms,
            temp_dir: cfg.temp_dir.clone(),
        }
    }

    /// Samples per frame.
    pub fn chunk_size(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Pre-roll depth and trailing-silence cutoff, in frames.
    pub fn silence_frames(&self) -> usize {
        (self.silence_duration_ms / self.frame_duration_ms).max(1) as usize
    }
}

/// A finalized speech segment on disk.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub path: PathBuf,
    /// Duration of the emitted WAV (pre-roll + speech + silence tail).
    pub duration_ms: u64,
    /// Monotonically increasing per-process index.
    pub index: u64,
}

/// Frame-driven utterance segmenter.
pub struct Segmenter {
    config: SegmenterConfig,
    vad: Box<dyn VoiceActivityDetector>,
    /// Rolling pre-speech frames, capacity `silence_frames()`.
    preroll: VecDeque<Vec<i16>>,
    /// Append-only capture buffer for the active segment.
    capture: Vec<i16>,
    /// Samples flushed from the pre-roll at speech onset.
    onset_samples: usize,
    /// Consecutive silence frames while recording.
    trailing_silence: usize,
    recording: bool,
    utterance_index: u64,
    pending_path: Option<PathBuf>,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig, vad: Box<dyn VoiceActivityDetector>) -> Result<Self> {
        std::fs::create_dir_all(&config.temp_dir)?;
        Ok(Self {
            config,
            vad,
            preroll: VecDeque::new(),
            capture: Vec::new(),
            onset_samples: 0,
            trailing_silence: 0,
            recording: false,
            utterance_index: 0,
            pending_path: None,
        })
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Total utterance indices handed out so far (discarded segments included).
    pub fn utterance_count(&self) -> u64 {
        self.utterance_index
    }

    /// Feed one PCM frame. Returns a finalized utterance when the trailing
    /// silence window completes and the segment meets the minimum duration.
    pub fn push_frame(&mut self, frame: &[i16]) -> Result<Option<Utterance>> {
        let is_speech = self.vad.classify(frame).is_speech();

        if !self.recording {
            if is_speech {
                self.start_recording(frame);
            } else {
                // Keep a rolling pre-roll; evict the oldest once full.
                if self.preroll.len() >= self.config.silence_frames() {
                    self.preroll.pop_front();
                }
                self.preroll.push_back(frame.to_vec());
            }
            return Ok(None);
        }

        self.capture.extend_from_slice(frame);
        if is_speech {
            self.trailing_silence = 0;
            return Ok(None);
        }

        self.trailing_silence += 1;
        if self.trailing_silence >= self.config.silence_frames() {
            return self.finalize();
        }
        Ok(None)
    }

    /// Finalize an in-flight segment, applying the usual minimum-duration
    /// check. Called on shutdown so buffered speech is not lost.
    pub fn finish(&mut self) -> Result<Option<Utterance>> {
        if self.recording {
            self.finalize()
        } else {
            Ok(None)
        }
    }

    fn start_recording(&mut self, frame: &[i16]) {
        self.recording = true;
        self.utterance_index += 1;
        let filename = format!("audio_{:04}.wav", self.utterance_index);
        let path = self.config.temp_dir.join(&filename);

        self.capture.clear();
        self.onset_samples = 0;
        for buffered in self.preroll.drain(..) {
            self.onset_samples += buffered.len();
            self.capture.extend_from_slice(&buffered);
        }
        self.capture.extend_from_slice(frame);
        self.trailing_silence = 0;
        self.pending_path = Some(path);

        info!(file = filename.as_str(), "utterance started");
    }

    fn finalize(&mut self) -> Result<Option<Utterance>> {
        let path = match self.pending_path.take() {
            Some(p) => p,
            None => {
                self.reset_segment();
                return Ok(None);
            }
        };

        let trailing_samples = self.trailing_silence * self.config.chunk_size();
        let speech_samples = self
            .capture
            .len()
            .saturating_sub(self.onset_samples)
            .saturating_sub(trailing_samples);
        let speech_ms = self.samples_to_ms(speech_samples);

        if speech_ms < u64::from(self.config.min_recording_duration_ms) {
            info!(speech_ms, "segment too short, discarding");
            self.discard(&path);
            self.reset_segment();
            return Ok(None);
        }

        let duration_ms = self.samples_to_ms(self.capture.len());
        if let Err(e) = self.write_wav(&path) {
            self.discard(&path);
            self.reset_segment();
            return Err(e);
        }

        let index = self.utterance_index;
        info!(
            file = %path.display(),
            duration_ms,
            speech_ms,
            "utterance finalized"
        );
        self.reset_segment();

        Ok(Some(Utterance {
            path,
            duration_ms,
            index,
        }))
    }

    fn write_wav(&self, path: &std::path::Path) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.config.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)
            .map_err(|e| AuricleError::AudioStream(format!("wav create: {e}")))?;
        for &sample in &self.capture {
            writer
                .write_sample(sample)
                .map_err(|e| AuricleError::AudioStream(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AuricleError::AudioStream(format!("wav finalize: {e}")))?;
        Ok(())
    }

    fn discard(&self, path: &std::path::Path) {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                error!(file = %path.display(), "failed to remove partial file: {e}");
            }
        }
    }

    fn reset_segment(&mut self) {
        self.recording = false;
        self.capture.clear();
        self.preroll.clear();
        self.onset_samples = 0;
        self.trailing_silence = 0;
        self.pending_path = None;
        self.vad.reset();
    }

    fn samples_to_ms(&self, samples: usize) -> u64 {
        (samples as u64 * 1000) / u64::from(self.config.sample_rate)
    }
}

/// Run the blocking capture loop until `running` becomes false or the source
/// fails. Each finalized utterance is handed to `sink` exactly once; sink
/// failures are logged and never propagate back into the loop.
pub fn run<S, F>(source: &mut S, segmenter: &mut Segmenter, mut sink: F, running: &AtomicBool)
where
    S: FrameSource,
    F: FnMut(Utterance) -> anyhow::Result<()>,
{
    info!("capture loop started");

    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match source.read_frame() {
            Ok(Some(frame)) => match segmenter.push_frame(&frame) {
                Ok(Some(utterance)) => deliver(&mut sink, utterance),
                Ok(None) => {}
                Err(e) => error!("segmenter error: {e}"),
            },
            // The source observed shutdown.
            Ok(None) => break,
            Err(e) => {
                error!("audio read error: {e}");
                break;
            }
        }
    }

    // Flush an in-flight segment so stop doesn't lose buffered speech.
    match segmenter.finish() {
        Ok(Some(utterance)) => deliver(&mut sink, utterance),
        Ok(None) => {}
        Err(e) => error!("failed to finalize segment on stop: {e}"),
    }

    info!(
        utterances = segmenter.utterance_count(),
        "capture loop stopped"
    );
}

fn deliver<F>(sink: &mut F, utterance: Utterance)
where
    F: FnMut(Utterance) -> anyhow::Result<()>,
{
    debug!(file = %utterance.path.display(), "delivering utterance");
    if let Err(e) = sink(utterance) {
        warn!("utterance sink failed: {e}");
    }
}
