//! One-shot subcommand implementations.
//!
//! Every command here builds just the components it needs, performs one
//! round of work and returns a JSON value for the caller to print.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};

use auricle_core::{
    audio, queue::TranscriptQueue, sender::SenderConfig, transcribe, PipelineConfig, Sender,
};

fn open_queue(config: &PipelineConfig) -> anyhow::Result<Arc<TranscriptQueue>> {
    Ok(Arc::new(
        TranscriptQueue::from_pipeline(config).context("opening queue store")?,
    ))
}

fn build_sender(config: &PipelineConfig, queue: Arc<TranscriptQueue>) -> anyhow::Result<Sender> {
    Sender::new(queue, SenderConfig::from_pipeline(config)).context("building sender")
}

/// `status` — snapshot of queue, transcripts and connectivity.
pub async fn status(config: &PipelineConfig) -> anyhow::Result<Value> {
    let queue = open_queue(config)?;
    let sender = build_sender(config, Arc::clone(&queue))?;
    let online = sender.check_connectivity().await;
    sender.set_online(online);

    let transcripts = transcribe::transcript_stats(&config.output_dir);

    Ok(json!({
        "online": online,
        "queue": queue.stats()?,
        "transcripts": {
            "backend": config.whisper_backend,
            "model_path": config.model_path.display().to_string(),
            "model_name": config.model_name,
            "model_exists": config.model_path.exists(),
            "total_transcripts": transcripts.total_transcripts,
            "last_counter": transcripts.last_counter,
            "output_dir": transcripts.output_dir,
        },
        "sender": sender.status()?,
        "config": {
            "api_url": config.api_url,
            "has_token": config.api_token.is_some(),
            "sample_rate": config.sample_rate,
            "vad_aggressiveness": config.vad_aggressiveness,
            "silence_duration_ms": config.silence_duration_ms,
            "min_recording_duration_ms": config.min_recording_duration_ms,
            "request_timeout": config.request_timeout,
            "max_retries": config.max_retries,
            "max_concurrent_sends": config.max_concurrent_sends,
        },
    }))
}

/// `test` — exercise microphone, speech backend and remote API.
pub async fn test(config: &PipelineConfig) -> anyhow::Result<Value> {
    // Microphone: two seconds of capture must yield a non-empty stream.
    let microphone = tokio::task::spawn_blocking(|| audio::test_capture(Duration::from_secs(2)))
        .await
        .context("microphone test task")?;
    let microphone = match microphone {
        Ok(samples) => json!({"success": true, "captured_samples": samples}),
        Err(e) => json!({"success": false, "error": e.to_string()}),
    };

    // Speech backend: loading (with fallback) is the meaningful check.
    let backend_config = config.clone();
    let transcription = tokio::task::spawn_blocking(move || {
        transcribe::load_backend(&backend_config).map(|b| b.name().to_string())
    })
    .await
    .context("backend test task")?;
    let transcription = match transcription {
        Ok(name) => json!({"success": true, "backend": name}),
        Err(e) => json!({"success": false, "error": e.to_string()}),
    };

    // Remote API: one /health round trip.
    let queue = open_queue(config)?;
    let sender = build_sender(config, queue)?;
    let connection = sender.test_connection().await;

    Ok(json!({
        "microphone": microphone,
        "transcription": transcription,
        "connection": connection,
    }))
}

/// `queue` — statistics plus pending and recent items.
pub fn queue_info(config: &PipelineConfig) -> anyhow::Result<Value> {
    let queue = open_queue(config)?;
    let pending: Vec<_> = queue.all_pending()?.into_iter().take(10).collect();
    let recent = queue.list_all(20)?;

    Ok(json!({
        "stats": queue.stats()?,
        "pending": pending,
        "recent": recent,
    }))
}

/// `retry --item-id` — reset attempts and redeliver immediately if online.
pub async fn retry(config: &PipelineConfig, item_id: &str) -> anyhow::Result<Value> {
    let queue = open_queue(config)?;
    let sender = build_sender(config, Arc::clone(&queue))?;
    let online = sender.check_connectivity().await;
    sender.set_online(online);

    let item = sender
        .retry(item_id)
        .await
        .with_context(|| format!("retrying {item_id}"))?;

    Ok(json!({
        "success": true,
        "online": online,
        "item": item,
    }))
}

/// `cleanup --days` — drop old sent queue items and old transcript files.
pub fn cleanup(config: &PipelineConfig, days: u64) -> anyhow::Result<Value> {
    let queue = open_queue(config)?;
    let queue_removed = queue.cleanup(days)?;
    let transcripts_removed = transcribe::cleanup_old_transcripts(&config.output_dir, days)?;

    Ok(json!({
        "queue_removed": queue_removed,
        "transcripts_removed": transcripts_removed,
        "total_removed": queue_removed + transcripts_removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn status_reports_offline_without_network_expectations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        // Point the API at a closed local port; the probe must simply fail.
        config.api_url = Some("http://127.0.0.1:9".into());

        let value = status(&config).await.expect("status");
        assert!(value["queue"]["total"].is_number());
        assert_eq!(value["transcripts"]["total_transcripts"], 0);
        assert_eq!(value["config"]["has_token"], false);
    }

    #[tokio::test]
    async fn queue_info_lists_pending_items() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());

        {
            let queue = TranscriptQueue::from_pipeline(&config).expect("queue");
            queue
                .add(&auricle_core::TranscriptRecord {
                    text: "hello".into(),
                    file: dir.path().join("0001.txt"),
                    timestamp: chrono::Local::now().to_rfc3339(),
                    duration: 0.2,
                    backend: "stub".into(),
                })
                .expect("add");
        }

        let value = queue_info(&config).expect("queue info");
        assert_eq!(value["stats"]["pending"], 1);
        assert_eq!(value["pending"].as_array().expect("array").len(), 1);
        assert_eq!(value["pending"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn retry_unknown_item_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        assert!(retry(&config, "tq-missing").await.is_err());
    }

    #[test]
    fn cleanup_on_empty_stores_reports_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let value = cleanup(&config, 30).expect("cleanup");
        assert_eq!(value["total_removed"], 0);
    }
}
