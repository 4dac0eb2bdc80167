//! Connectivity-aware transcript dispatcher.
//!
//! Two periodic tasks cooperate around the queue:
//!
//! 1. The **prober** keeps an atomic `online` flag current: it must reach a
//!    well-known internet endpoint over TCP *and* get a `< 400` response
//!    from `{api_url}/health`, both under short timeouts.
//! 2. The **dispatcher** wakes every `send_check_interval` and, while
//!    online, claims eligible queue items — first-attempt items oldest
//!    first, then retryable ones — up to `max_concurrent_sends`. Items are
//!    marked `sending` at claim time; the POST itself runs in a spawned
//!    task so one slow request never stalls the loop.
//!
//! HTTP outcomes map onto queue transitions:
//!
//! | outcome                  | transition                          |
//! |--------------------------|-------------------------------------|
//! | 2xx                      | `mark_sent` (response stored)       |
//! | connect / DNS error      | `mark_failed(connection_error)` + `online = false` |
//! | timeout                  | `mark_failed(timeout)`              |
//! | 408 / 429 / 5xx          | `mark_failed(http_error)`           |
//! | other 4xx                | `mark_permanent_failure(http_error)`|
//! | anything else            | `mark_failed(unexpected_error)`     |

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AuthHeader, PipelineConfig};
use crate::error::{AuricleError, Result};
use crate::queue::{now_iso, QueueItem, QueueStats, TranscriptQueue};

/// Timeout for both halves of the connectivity probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Sender-side configuration, derived from the pipeline config.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub auth_header: AuthHeader,
    pub connectivity_check_interval: Duration,
    pub send_check_interval: Duration,
    pub request_timeout: Duration,
    pub max_concurrent_sends: usize,
    /// TCP endpoint used as the internet-reachability reference.
    pub probe_addr: String,
}

impl SenderConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Self {
        Self {
            api_url: cfg.api_url.clone(),
            api_token: cfg.api_token.clone(),
            auth_header: cfg.auth_header,
            connectivity_check_interval: Duration::from_secs(cfg.connectivity_check_interval),
            send_check_interval: Duration::from_secs(cfg.send_check_interval),
            request_timeout: cfg.request_timeout(),
            max_concurrent_sends: cfg.max_concurrent_sends,
            probe_addr: "8.8.8.8:53".into(),
        }
    }

    fn health_url(&self) -> Option<String> {
        self.api_url
            .as_ref()
            .map(|url| format!("{}/health", url.trim_end_matches('/')))
    }
}

/// Point-in-time view for the status logger and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SenderStatus {
    pub online: bool,
    pub active_sends: usize,
    pub queue: QueueStats,
    pub api_url: Option<String>,
    pub has_token: bool,
    pub request_timeout_secs: u64,
    pub max_concurrent_sends: usize,
}

/// Result of a one-shot `/health` round trip (the `test` subcommand).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Sender {
    queue: Arc<TranscriptQueue>,
    config: SenderConfig,
    client: reqwest::Client,
    online: AtomicBool,
    active_sends: AtomicUsize,
}

impl Sender {
    pub fn new(queue: Arc<TranscriptQueue>, config: SenderConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.api_token {
            match config.auth_header {
                AuthHeader::Bearer => {
                    let value = HeaderValue::from_str(&format!("Bearer {token}"))
                        .map_err(|e| AuricleError::Config(format!("invalid api token: {e}")))?;
                    headers.insert(AUTHORIZATION, value);
                }
                AuthHeader::ApiKey => {
                    let value = HeaderValue::from_str(token)
                        .map_err(|e| AuricleError::Config(format!("invalid api token: {e}")))?;
                    headers.insert("X-API-Key", value);
                }
            }
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("auricle/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AuricleError::Config(format!("http client: {e}")))?;

        Ok(Self {
            queue,
            config,
            client,
            online: AtomicBool::new(false),
            active_sends: AtomicUsize::new(0),
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::Relaxed);
        if was != online {
            info!(
                status = if online { "ONLINE" } else { "OFFLINE" },
                "connectivity changed"
            );
        }
    }

    pub fn active_sends(&self) -> usize {
        self.active_sends.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> Result<SenderStatus> {
        Ok(SenderStatus {
            online: self.is_online(),
            active_sends: self.active_sends(),
            queue: self.queue.stats()?,
            api_url: self.config.api_url.clone(),
            has_token: self.config.api_token.is_some(),
            request_timeout_secs: self.config.request_timeout.as_secs(),
            max_concurrent_sends: self.config.max_concurrent_sends,
        })
    }

    /// Spawn the prober and dispatcher tasks. Both exit promptly once the
    /// shutdown channel flips to `true`.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let prober = {
            let sender = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let online = sender.check_connectivity().await;
                    sender.set_online(online);
                    tokio::select! {
                        _ = tokio::time::sleep(sender.config.connectivity_check_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("connectivity prober stopped");
            })
        };

        let dispatcher = {
            let sender = Arc::clone(self);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(sender.config.send_check_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    if sender.is_online() {
                        sender.dispatch_tick();
                    }
                }
                debug!("dispatcher stopped");
            })
        };

        info!("sender started");
        vec![prober, dispatcher]
    }

    /// True iff the internet reference is reachable and the API health
    /// endpoint answers below 400.
    pub async fn check_connectivity(&self) -> bool {
        let reachable = matches!(
            tokio::time::timeout(
                PROBE_TIMEOUT,
                tokio::net::TcpStream::connect(self.config.probe_addr.as_str()),
            )
            .await,
            Ok(Ok(_))
        );
        if !reachable {
            debug!(probe = self.config.probe_addr.as_str(), "internet probe failed");
            return false;
        }

        match self.config.health_url() {
            Some(url) => match self
                .client
                .get(&url)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) => resp.status().as_u16() < 400,
                Err(e) => {
                    debug!("health probe failed: {e}");
                    false
                }
            },
            None => true,
        }
    }

    /// One dispatcher pass: claim eligible items up to the concurrency cap.
    pub fn dispatch_tick(self: &Arc<Self>) {
        if self.config.api_url.is_none() {
            return;
        }

        let mut capacity = self
            .config
            .max_concurrent_sends
            .saturating_sub(self.active_sends());

        // First attempts, oldest first.
        while capacity > 0 {
            match self.queue.next_pending() {
                Ok(Some(item)) => {
                    if self.begin_send(item) {
                        capacity -= 1;
                    } else {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("queue poll failed: {e}");
                    return;
                }
            }
        }
        if capacity == 0 {
            return;
        }

        // Then items whose backoff has elapsed.
        let retryable = match self.queue.retryable() {
            Ok(items) => items,
            Err(e) => {
                error!("queue poll failed: {e}");
                return;
            }
        };
        for item in retryable.into_iter().take(capacity) {
            self.begin_send(item);
        }
    }

    /// Claim `item` (pending → sending) and run the POST in a spawned task.
    /// Returns false when the claim was rejected.
    fn begin_send(self: &Arc<Self>, item: QueueItem) -> bool {
        if let Err(e) = self.queue.mark_sending(&item.id) {
            warn!(id = item.id.as_str(), "failed to claim item: {e}");
            return false;
        }
        self.active_sends.fetch_add(1, Ordering::SeqCst);

        let sender = Arc::clone(self);
        tokio::spawn(async move {
            sender.send_item(&item).await;
            sender.active_sends.fetch_sub(1, Ordering::SeqCst);
        });
        true
    }

    /// POST one claimed item and feed the outcome back into the queue.
    /// `item` is the pre-claim snapshot: `attempt` in the payload carries
    /// the attempt count before this try.
    pub async fn send_item(&self, item: &QueueItem) {
        let Some(api_url) = self.config.api_url.clone() else {
            error!("api_url not configured");
            return;
        };

        info!(id = item.id.as_str(), attempt = item.attempts + 1, "sending");

        let payload = json!({
            "id": item.id,
            "timestamp": item.transcript_timestamp,
            "text": item.text,
            "queued_at": item.timestamp,
            "attempt": item.attempts,
        });

        match self.client.post(&api_url).json(&payload).send().await {
            Ok(resp) => {
                let status = resp.status();
                let code = status.as_u16();
                if status.is_success() {
                    let headers: serde_json::Map<String, serde_json::Value> = resp
                        .headers()
                        .iter()
                        .map(|(k, v)| {
                            (
                                k.to_string(),
                                json!(v.to_str().unwrap_or_default()),
                            )
                        })
                        .collect();
                    let body: Option<serde_json::Value> = resp.json().await.ok();
                    let stored = json!({
                        "status": code,
                        "data": body,
                        "headers": headers,
                    });
                    if let Err(e) = self.queue.mark_sent(&item.id, Some(&stored)) {
                        error!(id = item.id.as_str(), "failed to record success: {e}");
                    } else {
                        info!(id = item.id.as_str(), status = code, "sent");
                    }
                } else if code == 408 || code == 429 || status.is_server_error() {
                    warn!(id = item.id.as_str(), status = code, "retryable http error");
                    self.record_failure(&item.id, failure("http_error", Some(code), &status.to_string()));
                } else if status.is_client_error() {
                    error!(id = item.id.as_str(), status = code, "permanent http error");
                    let err = failure("http_error", Some(code), &status.to_string());
                    if let Err(e) = self.queue.mark_permanent_failure(&item.id, &err) {
                        error!(id = item.id.as_str(), "failed to record permanent failure: {e}");
                    }
                } else {
                    warn!(id = item.id.as_str(), status = code, "unexpected http status");
                    self.record_failure(&item.id, failure("unexpected_error", Some(code), &status.to_string()));
                }
            }
            Err(e) if e.is_timeout() => {
                warn!(id = item.id.as_str(), "request timed out");
                self.record_failure(&item.id, failure("timeout", None, &e.to_string()));
            }
            Err(e) if e.is_connect() => {
                warn!(id = item.id.as_str(), "connection error: {e}");
                // Force a re-probe before the next dispatch tick.
                self.set_online(false);
                self.record_failure(&item.id, failure("connection_error", None, &e.to_string()));
            }
            Err(e) => {
                error!(id = item.id.as_str(), "unexpected send error: {e}");
                self.record_failure(&item.id, failure("unexpected_error", None, &e.to_string()));
            }
        }
    }

    fn record_failure(&self, id: &str, err: serde_json::Value) {
        if let Err(e) = self.queue.mark_failed(id, &err) {
            error!(id, "failed to record failure: {e}");
        }
    }

    /// Reset an item's attempts and, when online, dispatch it immediately.
    pub async fn retry(&self, id: &str) -> Result<QueueItem> {
        self.queue.reset_attempts(id)?;
        let item = self
            .queue
            .get(id)?
            .ok_or_else(|| AuricleError::ItemNotFound(id.to_string()))?;
        if self.is_online() {
            self.dispatch_one(item).await
        } else {
            warn!(id, "offline, retry will be picked up by the dispatcher");
            Ok(item)
        }
    }

    /// Dispatch an item immediately without touching its attempt counter.
    pub async fn force_send(&self, id: &str) -> Result<QueueItem> {
        let item = self
            .queue
            .get(id)?
            .ok_or_else(|| AuricleError::ItemNotFound(id.to_string()))?;
        self.dispatch_one(item).await
    }

    async fn dispatch_one(&self, item: QueueItem) -> Result<QueueItem> {
        self.queue.mark_sending(&item.id)?;
        self.send_item(&item).await;
        self.queue
            .get(&item.id)?
            .ok_or_else(|| AuricleError::ItemNotFound(item.id.clone()))
    }

    /// One-shot `/health` round trip with latency (the `test` subcommand).
    pub async fn test_connection(&self) -> ConnectionTest {
        let Some(url) = self.config.health_url() else {
            return ConnectionTest {
                success: false,
                status: None,
                response_time_secs: None,
                error: Some("api_url not configured".into()),
            };
        };

        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(resp) => ConnectionTest {
                success: resp.status().as_u16() < 400,
                status: Some(resp.status().as_u16()),
                response_time_secs: Some(started.elapsed().as_secs_f64()),
                error: None,
            },
            Err(e) => ConnectionTest {
                success: false,
                status: None,
                response_time_secs: None,
                error: Some(e.to_string()),
            },
        }
    }
}

fn failure(kind: &str, status_code: Option<u16>, message: &str) -> serde_json::Value {
    json!({
        "type": kind,
        "status_code": status_code,
        "message": message,
        "timestamp": now_iso(),
    })
}
