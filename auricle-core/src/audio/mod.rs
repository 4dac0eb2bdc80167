//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by writing directly into an SPSC ring
//! buffer producer whose `push_slice` is lock-free and allocation-free. When
//! the ring is full the overflow is dropped and logged; the stream continues.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` therefore must be created and dropped on the same
//! thread. The capture loop accomplishes this by calling `open_default`
//! inside `spawn_blocking`.

pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use ringbuf::{traits::Split, HeapRb};
use tracing::{error, info, warn};

use crate::error::{AuricleError, Result};
use resample::RateAdapter;

pub use ringbuf::traits::{Consumer, Producer};

/// Type alias for the producer half — held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half — held by the capture-loop thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^22 = 4 194 304 f32 samples ≈ 87.4 s at 48 kHz.
/// This protects long utterances from callback drops while transcription
/// keeps the consumer busy.
pub const RING_CAPACITY: usize = 1 << 22;

/// Sleep while waiting for the ring to fill (avoids busy-wait burning a core).
const SLEEP_EMPTY_MS: u64 = 5;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Handle to an active audio capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open the system default microphone and push mono f32 PCM into
    /// `producer`. Falls back to the first available input device when no
    /// default is reported.
    ///
    /// # Errors
    /// Returns `AuricleError::NoDefaultInputDevice` when no microphone is
    /// available, or `AuricleError::AudioStream` if cpal fails to build the
    /// stream or the sample format is unsupported.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(mut producer: AudioProducer, running: Arc<AtomicBool>) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(d) => d,
            None => host
                .input_devices()
                .map_err(|e| AuricleError::AudioDevice(e.to_string()))?
                .next()
                .ok_or(AuricleError::NoDefaultInputDevice)?,
        };

        let name = device.name().unwrap_or_else(|_| "Input Device".into());
        info!(device = name.as_str(), "opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| AuricleError::AudioDevice(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(sample_rate, channels, "audio config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ch = channels as usize;
        // Pre-clone one Arc per sample format branch so each closure owns its flag.
        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);
        let running_u8 = Arc::clone(&running);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            let written = producer.push_slice(data);
                            if written < data.len() {
                                warn!("ring buffer full: dropped {} samples", data.len() - written);
                            }
                            return;
                        }
                        downmix(&mut mix_buf, data.len() / ch, |f| {
                            let base = f * ch;
                            data[base..base + ch].iter().sum::<f32>() / ch as f32
                        });
                        let written = producer.push_slice(&mix_buf);
                        if written < mix_buf.len() {
                            warn!("ring buffer full: dropped {} samples", mix_buf.len() - written);
                        }
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix(&mut mix_buf, data.len() / ch, |f| {
                            let base = f * ch;
                            data[base..base + ch]
                                .iter()
                                .map(|&s| f32::from(s) / 32768.0)
                                .sum::<f32>()
                                / ch as f32
                        });
                        let written = producer.push_slice(&mix_buf);
                        if written < mix_buf.len() {
                            warn!("ring buffer full: dropped {} samples", mix_buf.len() - written);
                        }
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            SampleFormat::U8 => {
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if !running_u8.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix(&mut mix_buf, data.len() / ch, |f| {
                            let base = f * ch;
                            data[base..base + ch]
                                .iter()
                                .map(|&s| (f32::from(s) - 128.0) / 128.0)
                                .sum::<f32>()
                                / ch as f32
                        });
                        let written = producer.push_slice(&mix_buf);
                        if written < mix_buf.len() {
                            warn!("ring buffer full: dropped {} samples", mix_buf.len() - written);
                        }
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(AuricleError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| AuricleError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AuricleError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_default(_producer: AudioProducer, _running: Arc<AtomicBool>) -> Result<Self> {
        Err(AuricleError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Average interleaved channels into `mix_buf` (resized to `frames`).
#[cfg(feature = "audio-cpal")]
fn downmix(mix_buf: &mut Vec<f32>, frames: usize, mut frame_value: impl FnMut(usize) -> f32) {
    mix_buf.resize(frames, 0.0);
    for (f, slot) in mix_buf.iter_mut().enumerate() {
        *slot = frame_value(f);
    }
}

/// Source of fixed-size PCM frames. Abstracted so the capture loop can be
/// driven by scripted sources in tests.
pub trait FrameSource {
    /// Block until one full frame is available. Returns `Ok(None)` once the
    /// shared running flag has been cleared.
    fn read_frame(&mut self) -> Result<Option<Vec<i16>>>;
}

/// Converts the ring buffer's device-rate f32 stream into fixed-size mono
/// 16-bit frames at the configured rate.
pub struct FrameReader {
    consumer: AudioConsumer,
    adapter: RateAdapter,
    /// Rate-adapted samples awaiting the next frame cut.
    pending: Vec<f32>,
    scratch: Vec<f32>,
    chunk_size: usize,
    running: Arc<AtomicBool>,
}

impl FrameReader {
    pub fn new(
        consumer: AudioConsumer,
        capture_rate: u32,
        target_rate: u32,
        chunk_size: usize,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let adapter = RateAdapter::new(capture_rate, target_rate, chunk_size.max(1))?;
        Ok(Self {
            consumer,
            adapter,
            pending: Vec::with_capacity(chunk_size * 4),
            scratch: vec![0f32; chunk_size.max(1)],
            chunk_size,
            running,
        })
    }
}

impl FrameSource for FrameReader {
    fn read_frame(&mut self) -> Result<Option<Vec<i16>>> {
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return Ok(None);
            }

            if self.pending.len() >= self.chunk_size {
                let frame: Vec<i16> = self
                    .pending
                    .drain(..self.chunk_size)
                    .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                    .collect();
                return Ok(Some(frame));
            }

            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
                continue;
            }

            let FrameReader {
                adapter,
                pending,
                scratch,
                ..
            } = self;
            adapter.feed(&scratch[..n], pending);
        }
    }
}

/// Exercise the capture device for `duration` and succeed iff a non-empty
/// capture arrived. Used by the `test` subcommand.
///
/// Must run on a blocking thread (the stream is `!Send`).
pub fn test_capture(duration: Duration) -> Result<u64> {
    let running = Arc::new(AtomicBool::new(true));
    let (producer, mut consumer) = create_audio_ring();
    let capture = AudioCapture::open_default(producer, Arc::clone(&running))?;

    let mut scratch = vec![0f32; 4096];
    let mut total: u64 = 0;
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        let n = consumer.pop_slice(&mut scratch);
        total += n as u64;
        if n == 0 {
            std::thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
        }
    }
    capture.stop();
    drop(capture);

    if total == 0 {
        return Err(AuricleError::AudioStream(
            "no signal captured from input device".into(),
        ));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reader_cuts_fixed_frames() {
        let (mut producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let mut reader = FrameReader::new(consumer, 16_000, 16_000, 480, Arc::clone(&running))
            .expect("reader init");

        // 2.5 frames worth of half-scale samples
        producer.push_slice(&vec![0.5f32; 1_200]);

        let first = reader.read_frame().expect("read").expect("frame");
        assert_eq!(first.len(), 480);
        assert!(first.iter().all(|&s| s == (0.5f32 * 32767.0) as i16));

        let second = reader.read_frame().expect("read").expect("frame");
        assert_eq!(second.len(), 480);

        // Remaining 240 samples are not a full frame; stopping unblocks.
        running.store(false, Ordering::SeqCst);
        assert!(reader.read_frame().expect("read").is_none());
    }

    #[test]
    fn frame_reader_clamps_out_of_range_samples() {
        let (mut producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let mut reader =
            FrameReader::new(consumer, 16_000, 16_000, 4, running).expect("reader init");

        producer.push_slice(&[2.0, -2.0, 0.0, 1.0]);
        let frame = reader.read_frame().expect("read").expect("frame");
        assert_eq!(frame, vec![32767, -32767, 0, 32767]);
    }
}
