//! `PipelineAgent` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! PipelineAgent::new()   → queue opened, orphan sweep, sender built
//!     └─► run()          → worker + capture thread + sender tasks spawned
//!         └─► ctrl-c     → capture stopped first, then worker drained,
//!                          then sender tasks, each under a bounded join
//! ```
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send`, so the capture device is opened *inside* the
//! `spawn_blocking` closure and never crosses a thread boundary; a oneshot
//! channel propagates open success/failure back to `run()`. The
//! transcription worker is a second blocking task fed through a bounded
//! crossbeam mailbox: the segmenter sink enqueues and returns immediately,
//! and on overflow the oldest queued utterance is dropped (with its WAV)
//! rather than stalling the capture loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender as ChannelSender, TrySendError};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audio::{create_audio_ring, AudioCapture, FrameReader};
use crate::config::PipelineConfig;
use crate::error::{AuricleError, Result};
use crate::queue::TranscriptQueue;
use crate::segment::{self, Segmenter, SegmenterConfig, Utterance};
use crate::sender::{Sender, SenderConfig};
use crate::transcribe::Transcriber;
use crate::vad::build_detector;

/// Bounded mailbox between the segmenter sink and the transcription worker.
const MAILBOX_CAP: usize = 8;

/// Period of the status log line.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Per-task join budget during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Monotonic counters reported by the status logger.
#[derive(Debug, Default)]
pub struct AgentStats {
    pub transcriptions: AtomicU64,
    pub errors: AtomicU64,
}

pub struct PipelineAgent {
    config: PipelineConfig,
    queue: Arc<TranscriptQueue>,
    sender: Arc<Sender>,
    running: Arc<AtomicBool>,
    stats: Arc<AgentStats>,
}

impl PipelineAgent {
    /// Initialise components bottom-up: queue (with the startup sweep that
    /// returns orphaned `sending` items to `pending`), then the sender.
    /// The transcriber and the capture device are opened inside their own
    /// threads when `run()` starts.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(TranscriptQueue::from_pipeline(&config)?);
        queue.recover_orphans()?;

        let sender = Arc::new(Sender::new(
            Arc::clone(&queue),
            SenderConfig::from_pipeline(&config),
        )?);

        Ok(Self {
            config,
            queue,
            sender,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(AgentStats::default()),
        })
    }

    pub fn queue(&self) -> &Arc<TranscriptQueue> {
        &self.queue
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn stats(&self) -> &Arc<AgentStats> {
        &self.stats
    }

    /// Run the pipeline until interrupted (or the capture device is lost).
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AuricleError::AlreadyRunning);
        }

        let (utterance_tx, utterance_rx) = crossbeam_channel::bounded::<Utterance>(MAILBOX_CAP);

        // ── Transcription worker ─────────────────────────────────────────
        let (backend_ready_tx, backend_ready_rx) = tokio::sync::oneshot::channel::<Result<()>>();
        let mut worker_handle = {
            let config = self.config.clone();
            let queue = Arc::clone(&self.queue);
            let stats = Arc::clone(&self.stats);
            let utterance_rx = utterance_rx.clone();
            tokio::task::spawn_blocking(move || {
                // Backend load happens on this thread; decoder state stays here.
                let mut transcriber = match Transcriber::new(&config) {
                    Ok(t) => {
                        let _ = backend_ready_tx.send(Ok(()));
                        t
                    }
                    Err(e) => {
                        let _ = backend_ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(utterance) = utterance_rx.recv() {
                    match transcriber.transcribe_file(&utterance.path) {
                        Ok(Some(record)) => {
                            info!(text = record.text.as_str(), "transcribed");
                            match queue.add(&record) {
                                Ok(_) => {
                                    stats.transcriptions.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    error!("failed to enqueue transcript: {e}");
                                    stats.errors.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("transcription failed: {e}");
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                info!("transcription worker stopped");
            })
        };

        match backend_ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(AuricleError::Other(anyhow::anyhow!(
                    "transcription worker died during startup"
                )));
            }
        }

        // ── Segmenter capture thread ─────────────────────────────────────
        let (open_tx, open_rx) = tokio::sync::oneshot::channel::<Result<u32>>();
        let mut capture_handle = {
            let config = self.config.clone();
            let running = Arc::clone(&self.running);
            let sink_tx = utterance_tx;
            let sink_rx = utterance_rx;
            tokio::task::spawn_blocking(move || -> Result<()> {
                let (producer, consumer) = create_audio_ring();

                // Open the device on THIS thread — cpal::Stream is !Send.
                let capture = match AudioCapture::open_default(producer, Arc::clone(&running)) {
                    Ok(c) => {
                        let _ = open_tx.send(Ok(c.sample_rate));
                        c
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = open_tx.send(Err(e));
                        return Ok(());
                    }
                };

                let mut reader = FrameReader::new(
                    consumer,
                    capture.sample_rate,
                    config.sample_rate,
                    config.chunk_size(),
                    Arc::clone(&running),
                )?;
                let vad = build_detector(config.vad_aggressiveness, config.sample_rate);
                let mut segmenter = Segmenter::new(SegmenterConfig::from_pipeline(&config), vad)?;

                segment::run(
                    &mut reader,
                    &mut segmenter,
                    |utterance| enqueue_utterance(&sink_tx, &sink_rx, utterance),
                    &running,
                );

                // Stream drops here, releasing the audio device on this thread.
                drop(capture);
                Ok(())
            })
        };

        match open_rx.await {
            Ok(Ok(rate)) => info!(capture_rate = rate, "pipeline started — listening"),
            Ok(Err(e)) => {
                self.shutdown_worker(&mut worker_handle).await;
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
            Err(_) => {
                self.shutdown_worker(&mut worker_handle).await;
                self.running.store(false, Ordering::SeqCst);
                return Err(AuricleError::Other(anyhow::anyhow!(
                    "capture thread died during startup"
                )));
            }
        }

        // ── Sender + status tasks ────────────────────────────────────────
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sender_handles = self.sender.spawn(shutdown_rx.clone());
        let status_handle = tokio::spawn(status_loop(
            Arc::clone(&self.sender),
            Arc::clone(&self.stats),
            shutdown_rx,
        ));

        // ── Wait for interrupt or capture loss ───────────────────────────
        let mut capture_outcome: Option<std::result::Result<Result<()>, tokio::task::JoinError>> =
            None;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping components");
            }
            joined = &mut capture_handle => {
                warn!("capture loop ended unexpectedly");
                capture_outcome = Some(joined);
            }
        }

        // ── Teardown, top of the pipeline first ──────────────────────────
        self.running.store(false, Ordering::SeqCst);

        let capture_died = capture_outcome.is_some();
        let capture_outcome = match capture_outcome {
            Some(outcome) => outcome,
            None => match tokio::time::timeout(SHUTDOWN_GRACE, &mut capture_handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("capture thread did not stop within grace period");
                    Ok(Ok(()))
                }
            },
        };

        self.shutdown_worker(&mut worker_handle).await;

        let _ = shutdown_tx.send(true);
        for handle in sender_handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("sender task did not stop within grace period");
            }
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, status_handle)
            .await
            .is_err()
        {
            warn!("status task did not stop within grace period");
        }

        info!("pipeline stopped");

        match capture_outcome {
            Ok(Ok(())) if capture_died => Err(AuricleError::AudioStream(
                "capture loop terminated unexpectedly".into(),
            )),
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(join_err) => Err(AuricleError::Other(anyhow::anyhow!(
                "capture thread panicked: {join_err}"
            ))),
        }
    }

    async fn shutdown_worker(
        &self,
        handle: &mut tokio::task::JoinHandle<()>,
    ) {
        // The worker exits once every mailbox sender is gone; the capture
        // closure owns the last one. Bounded wait, in-flight work may finish.
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("transcription worker did not stop within grace period");
        }
    }
}

/// Segmenter sink: enqueue into the bounded mailbox, dropping the oldest
/// queued utterance (and its WAV) when the worker has fallen behind.
fn enqueue_utterance(
    tx: &ChannelSender<Utterance>,
    rx: &Receiver<Utterance>,
    utterance: Utterance,
) -> anyhow::Result<()> {
    match tx.try_send(utterance) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(utterance)) => {
            if let Ok(oldest) = rx.try_recv() {
                warn!(
                    dropped = %oldest.path.display(),
                    "transcription backlog full, dropping oldest utterance"
                );
                let _ = std::fs::remove_file(&oldest.path);
            }
            match tx.try_send(utterance) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(rejected)) | Err(TrySendError::Disconnected(rejected)) => {
                    let _ = std::fs::remove_file(&rejected.path);
                    anyhow::bail!("utterance mailbox unavailable")
                }
            }
        }
        Err(TrySendError::Disconnected(rejected)) => {
            let _ = std::fs::remove_file(&rejected.path);
            anyhow::bail!("transcription worker is gone")
        }
    }
}

async fn status_loop(
    sender: Arc<Sender>,
    stats: Arc<AgentStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(STATUS_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }
        match sender.status() {
            Ok(status) => info!(
                online = status.online,
                pending = status.queue.pending,
                sent = status.queue.sent,
                failed = status.queue.failed_permanent,
                active_sends = status.active_sends,
                transcriptions = stats.transcriptions.load(Ordering::Relaxed),
                errors = stats.errors.load(Ordering::Relaxed),
                "pipeline status"
            ),
            Err(e) => warn!("status snapshot failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    fn test_config(root: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            whisper_backend: "stub".into(),
            temp_dir: root.join("temp"),
            output_dir: root.join("transcripts"),
            queue_dir: root.join("queue"),
            log_dir: root.join("logs"),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn new_runs_the_startup_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());

        // Seed a queue with an item stuck in `sending`.
        {
            let queue = TranscriptQueue::from_pipeline(&config).expect("queue");
            let item = queue
                .add(&crate::transcribe::TranscriptRecord {
                    text: "stuck".into(),
                    file: PathBuf::from("/tmp/0001.txt"),
                    timestamp: chrono::Local::now().to_rfc3339(),
                    duration: 0.1,
                    backend: "stub".into(),
                })
                .expect("add");
            queue.mark_sending(&item.id).expect("sending");
        }

        let agent = PipelineAgent::new(config).expect("agent");
        let stats = agent.queue().stats().expect("stats");
        assert_eq!(stats.sending, 0);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn new_rejects_invalid_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            vad_aggressiveness: 7,
            ..test_config(dir.path())
        };
        assert!(matches!(
            PipelineAgent::new(config),
            Err(AuricleError::Config(_))
        ));
    }

    #[test]
    fn mailbox_overflow_drops_oldest_and_its_wav() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, rx) = crossbeam_channel::bounded::<Utterance>(2);

        let make = |i: u64| {
            let path = dir.path().join(format!("audio_{i:04}.wav"));
            std::fs::write(&path, b"riff").expect("write wav");
            Utterance {
                path,
                duration_ms: 600,
                index: i,
            }
        };

        let first = make(1);
        let first_path = first.path.clone();
        enqueue_utterance(&tx, &rx, first).expect("enqueue");
        enqueue_utterance(&tx, &rx, make(2)).expect("enqueue");

        // Mailbox is full: the oldest must give way and its WAV vanish.
        enqueue_utterance(&tx, &rx, make(3)).expect("enqueue with overflow");
        assert!(!first_path.exists());

        let remaining: Vec<u64> = rx.try_iter().map(|u| u.index).collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    #[test]
    fn mailbox_disconnect_deletes_the_wav() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, rx) = crossbeam_channel::bounded::<Utterance>(2);

        let path = dir.path().join("audio_0001.wav");
        std::fs::write(&path, b"riff").expect("write wav");
        let utterance = Utterance {
            path: path.clone(),
            duration_ms: 600,
            index: 1,
        };

        // Simulate the worker being gone.
        let orphan_rx = rx.clone();
        drop(rx);
        drop(orphan_rx);

        assert!(enqueue_utterance(&tx, &crossbeam_channel::bounded::<Utterance>(1).1, utterance).is_err());
        assert!(!path.exists());
    }
}
