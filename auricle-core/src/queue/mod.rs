//! Durable transcript queue.
//!
//! A single SQLite table holds every queue item; two indexes (status,
//! next_retry) keep the dispatcher's queries cheap. All mutations are
//! serialized under one process-internal mutex; SQLite's transactional
//! semantics cover the store side.
//!
//! ## State machine
//!
//! ```text
//!           add
//!            │
//!            ▼
//!        ┌────────┐  mark_sending   ┌─────────┐
//!        │pending │ ───────────────▶│ sending │
//!        └────────┘                 └─────────┘
//!           ▲  ▲                       │    │
//!           │  │ mark_failed(<max)     │    │ mark_sent
//!           │  └───────────────────────┘    ▼
//!           │                          ┌──────┐
//!           │ reset_attempts           │ sent │
//!           │                          └──────┘
//!           │ mark_failed(≥max) /
//!           │ mark_permanent_failure   ┌──────────────────┐
//!           └────────────────────────  │ failed_permanent │
//!                                      └──────────────────┘
//! ```
//!
//! Terminal states (`sent`, `failed_permanent`) are only left through an
//! explicit `reset_attempts`. Retry scheduling is exponential:
//! `delay(n) = min(base · 2^(n-1), max)`, clamped so large attempt counts
//! cannot overflow.
//!
//! Timestamps are RFC-3339 UTC strings with fixed microsecond precision, so
//! the lexicographic comparisons inside SQL are chronological.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{AuricleError, Result};
use crate::transcribe::TranscriptRecord;

/// Queue item lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Sending,
    Sent,
    FailedPermanent,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "failed_permanent" => Self::FailedPermanent,
            _ => Self::Pending,
        }
    }

    /// Terminal states never transition except through `reset_attempts`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::FailedPermanent)
    }
}

/// The canonical durable unit.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    /// When the item was enqueued (ISO-8601).
    pub timestamp: String,
    pub text: String,
    pub file_path: String,
    /// Creation time of the transcript itself (ISO-8601, payload field).
    pub transcript_timestamp: String,
    pub status: ItemStatus,
    pub attempts: u32,
    pub last_attempt: Option<String>,
    pub last_error: Option<String>,
    pub next_retry: Option<String>,
    pub created_at: String,
    pub sent_at: Option<String>,
    pub response: Option<String>,
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed_permanent: usize,
    pub total: usize,
}

/// Retry-schedule knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_secs(cfg.base_retry_delay),
            max_delay: Duration::from_secs(cfg.max_retry_delay),
        }
    }

    /// Backoff before attempt `n + 1`, given `n` attempts so far.
    /// Saturates at `max_delay`; immune to shift overflow for huge `n`.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let secs = self
            .base_delay
            .as_secs()
            .saturating_mul(1u64 << exp)
            .min(self.max_delay.as_secs());
        Duration::from_secs(secs)
    }
}

/// Durable FIFO queue of transcripts awaiting delivery.
pub struct TranscriptQueue {
    conn: Mutex<Connection>,
    policy: RetryPolicy,
    db_path: PathBuf,
}

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
CREATE TABLE IF NOT EXISTS transcript_queue (
  id TEXT PRIMARY KEY,
  timestamp TEXT NOT NULL,
  text TEXT NOT NULL,
  file_path TEXT NOT NULL,
  transcript_timestamp TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending',
  attempts INTEGER DEFAULT 0,
  last_attempt TEXT,
  last_error TEXT,
  next_retry TEXT,
  created_at TEXT NOT NULL,
  sent_at TEXT,
  response TEXT
);

CREATE INDEX IF NOT EXISTS idx_status ON transcript_queue(status);
CREATE INDEX IF NOT EXISTS idx_next_retry ON transcript_queue(next_retry);
"#;

const ITEM_COLUMNS: &str = "id, timestamp, text, file_path, transcript_timestamp, status, \
     attempts, last_attempt, last_error, next_retry, created_at, sent_at, response";

impl TranscriptQueue {
    /// Open (or create) the store at `{queue_dir}/queue.db`.
    pub fn open(queue_dir: &std::path::Path, policy: RetryPolicy) -> Result<Self> {
        std::fs::create_dir_all(queue_dir)?;
        let db_path = queue_dir.join("queue.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA)?;
        info!(db = %db_path.display(), "queue store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            policy,
            db_path,
        })
    }

    pub fn from_pipeline(cfg: &PipelineConfig) -> Result<Self> {
        Self::open(&cfg.queue_dir, RetryPolicy::from_pipeline(cfg))
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// Insert a new item in state `pending` with `attempts = 0`.
    pub fn add(&self, record: &TranscriptRecord) -> Result<QueueItem> {
        let id = new_id();
        let now = now_iso();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO transcript_queue \
                 (id, timestamp, text, file_path, transcript_timestamp, status, attempts, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6)",
                params![
                    id,
                    now,
                    record.text,
                    record.file.display().to_string(),
                    record.timestamp,
                    now,
                ],
            )?;
        }
        info!(id = id.as_str(), "queued transcript");
        self.get(&id)?
            .ok_or_else(|| AuricleError::ItemNotFound(id))
    }

    /// Oldest first-attempt item whose retry time (if any) has passed.
    pub fn next_pending(&self) -> Result<Option<QueueItem>> {
        let now = now_iso();
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM transcript_queue \
                     WHERE status = 'pending' AND attempts = 0 \
                       AND (next_retry IS NULL OR next_retry <= ?1) \
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![now],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// All previously-failed items whose backoff has elapsed, oldest first.
    pub fn retryable(&self) -> Result<Vec<QueueItem>> {
        let now = now_iso();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM transcript_queue \
             WHERE status = 'pending' AND attempts > 0 AND attempts < ?1 \
               AND (next_retry IS NULL OR next_retry <= ?2) \
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![self.policy.max_retries, now], row_to_item)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// All pending items, oldest first.
    pub fn all_pending(&self) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM transcript_queue \
             WHERE status = 'pending' ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], row_to_item)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Most recent items regardless of state (for inspection).
    pub fn list_all(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM transcript_queue \
             ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_item)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM transcript_queue WHERE id = ?1"),
                params![id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// `pending → sending`; increments `attempts`, stamps `last_attempt`.
    ///
    /// # Errors
    /// `InvalidTransition` when the item exists but is not `pending`,
    /// `ItemNotFound` when it does not exist.
    pub fn mark_sending(&self, id: &str) -> Result<()> {
        let now = now_iso();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE transcript_queue \
             SET status = 'sending', attempts = attempts + 1, last_attempt = ?1 \
             WHERE id = ?2 AND status = 'pending'",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(self.missing_or_conflict(&conn, id));
        }
        debug!(id, "marked sending");
        Ok(())
    }

    /// Any non-terminal state → `sent`; stores the response JSON.
    pub fn mark_sent(&self, id: &str, response: Option<&serde_json::Value>) -> Result<()> {
        let now = now_iso();
        let response_json = response.map(|v| v.to_string());
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE transcript_queue \
             SET status = 'sent', sent_at = ?1, response = ?2 \
             WHERE id = ?3 AND status NOT IN ('sent', 'failed_permanent')",
            params![now, response_json, id],
        )?;
        if changed == 0 {
            return Err(self.missing_or_conflict(&conn, id));
        }
        info!(id, "item sent");
        Ok(())
    }

    /// Record a failed attempt: recompute the backoff and return to
    /// `pending`, or to `failed_permanent` once `attempts ≥ max_retries`.
    /// Returns the resulting status.
    pub fn mark_failed(&self, id: &str, error: &serde_json::Value) -> Result<ItemStatus> {
        let error_json = error.to_string();
        let conn = self.conn.lock();
        let attempts: u32 = conn
            .query_row(
                "SELECT attempts FROM transcript_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| AuricleError::ItemNotFound(id.to_string()))?;

        if attempts >= self.policy.max_retries {
            conn.execute(
                "UPDATE transcript_queue SET status = 'failed_permanent', last_error = ?1 \
                 WHERE id = ?2",
                params![error_json, id],
            )?;
            warn!(id, attempts, "item failed permanently");
            return Ok(ItemStatus::FailedPermanent);
        }

        let delay = self.policy.delay_after(attempts);
        let next_retry = iso_after(delay);
        conn.execute(
            "UPDATE transcript_queue \
             SET status = 'pending', last_error = ?1, next_retry = ?2 \
             WHERE id = ?3",
            params![error_json, next_retry, id],
        )?;
        warn!(id, attempts, retry_in_secs = delay.as_secs(), "item failed, scheduled for retry");
        Ok(ItemStatus::Pending)
    }

    /// Directly park an item in `failed_permanent` (non-retryable outcome,
    /// e.g. a 4xx response). Pins `attempts` at the retry cap.
    pub fn mark_permanent_failure(&self, id: &str, error: &serde_json::Value) -> Result<()> {
        let error_json = error.to_string();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE transcript_queue \
             SET status = 'failed_permanent', last_error = ?1, attempts = ?2 \
             WHERE id = ?3",
            params![error_json, self.policy.max_retries, id],
        )?;
        if changed == 0 {
            return Err(AuricleError::ItemNotFound(id.to_string()));
        }
        warn!(id, "item failed permanently (non-retryable)");
        Ok(())
    }

    /// Force an item back to `pending` with a clean slate. Idempotent.
    pub fn reset_attempts(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE transcript_queue \
             SET attempts = 0, status = 'pending', last_error = NULL, next_retry = NULL \
             WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(AuricleError::ItemNotFound(id.to_string()));
        }
        info!(id, "attempts reset");
        Ok(())
    }

    /// Counts per status.
    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM transcript_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match ItemStatus::parse(&status) {
                ItemStatus::Pending => stats.pending = count,
                ItemStatus::Sending => stats.sending = count,
                ItemStatus::Sent => stats.sent = count,
                ItemStatus::FailedPermanent => stats.failed_permanent = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// Delete `sent` items older than `days`. Returns the removed count.
    pub fn cleanup(&self, days: u64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(days as i64))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM transcript_queue WHERE status = 'sent' AND sent_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            info!(removed, "removed old sent items");
        }
        Ok(removed)
    }

    /// Startup sweep: any item still in `sending` belonged to a previous
    /// process and is treated as orphaned. Returns the recovered count.
    pub fn recover_orphans(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let recovered = conn.execute(
            "UPDATE transcript_queue SET status = 'pending' WHERE status = 'sending'",
            [],
        )?;
        if recovered > 0 {
            warn!(recovered, "recovered orphaned in-flight items");
        }
        Ok(recovered)
    }

    fn missing_or_conflict(&self, conn: &Connection, id: &str) -> AuricleError {
        let exists = conn
            .query_row(
                "SELECT 1 FROM transcript_queue WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()
            .unwrap_or(None)
            .is_some();
        if exists {
            AuricleError::InvalidTransition(id.to_string())
        } else {
            AuricleError::ItemNotFound(id.to_string())
        }
    }
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let status: String = row.get(5)?;
    Ok(QueueItem {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        text: row.get(2)?,
        file_path: row.get(3)?,
        transcript_timestamp: row.get(4)?,
        status: ItemStatus::parse(&status),
        attempts: row.get::<_, i64>(6)? as u32,
        last_attempt: row.get(7)?,
        last_error: row.get(8)?,
        next_retry: row.get(9)?,
        created_at: row.get(10)?,
        sent_at: row.get(11)?,
        response: row.get(12)?,
    })
}

/// Fixed-width RFC-3339 UTC so SQL string comparison stays chronological.
pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn iso_after(delay: Duration) -> String {
    (Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()))
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn new_id() -> String {
    format!("tq-{}-{:08x}", Utc::now().timestamp_micros(), rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    fn record(text: &str) -> TranscriptRecord {
        TranscriptRecord {
            text: text.to_string(),
            file: PathBuf::from("/tmp/0001.txt"),
            timestamp: chrono::Local::now().to_rfc3339(),
            duration: 0.5,
            backend: "stub".into(),
        }
    }

    fn queue(dir: &Path) -> TranscriptQueue {
        TranscriptQueue::open(
            dir,
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
            },
        )
        .expect("queue open")
    }

    #[test]
    fn add_inserts_pending_with_zero_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());
        assert!(q.db_path().exists());

        let item = q.add(&record("hello world")).expect("add");
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.text, "hello world");
        assert!(item.next_retry.is_none());

        let stats = q.stats().expect("stats");
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 1);
    }

    #[test]
    fn ids_are_unique() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());
        let mut ids = std::collections::HashSet::new();
        for i in 0..50 {
            let item = q.add(&record(&format!("item {i}"))).expect("add");
            assert!(ids.insert(item.id), "duplicate id");
        }
    }

    #[test]
    fn next_pending_is_fifo_by_created_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let a = q.add(&record("first")).expect("add");
        std::thread::sleep(Duration::from_millis(2));
        let _b = q.add(&record("second")).expect("add");

        let next = q.next_pending().expect("next").expect("item");
        assert_eq!(next.id, a.id);
    }

    #[test]
    fn next_pending_skips_retry_items() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let a = q.add(&record("retrying")).expect("add");
        q.mark_sending(&a.id).expect("sending");
        q.mark_failed(&a.id, &serde_json::json!({"type": "timeout"}))
            .expect("failed");
        std::thread::sleep(Duration::from_millis(2));
        let b = q.add(&record("fresh")).expect("add");

        // `a` is older but has attempts > 0: first-attempt dispatch must
        // pick the fresh item.
        let next = q.next_pending().expect("next").expect("item");
        assert_eq!(next.id, b.id);
    }

    #[test]
    fn mark_sending_increments_attempts_and_rejects_non_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let item = q.add(&record("x")).expect("add");
        q.mark_sending(&item.id).expect("sending");

        let current = q.get(&item.id).expect("get").expect("item");
        assert_eq!(current.status, ItemStatus::Sending);
        assert_eq!(current.attempts, 1);
        assert!(current.last_attempt.is_some());

        // Already sending → invalid transition.
        let err = q.mark_sending(&item.id).expect_err("double sending");
        assert!(matches!(err, AuricleError::InvalidTransition(_)));

        let err = q.mark_sending("tq-missing").expect_err("missing item");
        assert!(matches!(err, AuricleError::ItemNotFound(_)));
    }

    #[test]
    fn mark_sent_is_terminal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let item = q.add(&record("x")).expect("add");
        q.mark_sending(&item.id).expect("sending");
        q.mark_sent(&item.id, Some(&serde_json::json!({"status": 200})))
            .expect("sent");

        let current = q.get(&item.id).expect("get").expect("item");
        assert_eq!(current.status, ItemStatus::Sent);
        assert!(current.status.is_terminal());
        assert!(current.sent_at.is_some());
        assert!(current.response.as_deref().unwrap_or("").contains("200"));

        // Terminal: neither mark_sent nor mark_sending may touch it again.
        assert!(q.mark_sent(&item.id, None).is_err());
        assert!(q.mark_sending(&item.id).is_err());
        let current = q.get(&item.id).expect("get").expect("item");
        assert_eq!(current.status, ItemStatus::Sent);
    }

    #[test]
    fn mark_failed_schedules_exponential_backoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());
        let err = serde_json::json!({"type": "http_error", "status_code": 503});

        let item = q.add(&record("x")).expect("add");

        // attempt 1 → +1 s
        q.mark_sending(&item.id).expect("sending");
        let status = q.mark_failed(&item.id, &err).expect("failed");
        assert_eq!(status, ItemStatus::Pending);
        let after_first = q.get(&item.id).expect("get").expect("item");
        assert_eq!(after_first.attempts, 1);
        let retry1 = after_first.next_retry.expect("next_retry");

        // make it immediately eligible again, then fail attempt 2 → +2 s
        force_next_retry(&q, &item.id, &now_iso());
        q.mark_sending(&item.id).expect("sending");
        q.mark_failed(&item.id, &err).expect("failed");
        let after_second = q.get(&item.id).expect("get").expect("item");
        assert_eq!(after_second.attempts, 2);
        let retry2 = after_second.next_retry.expect("next_retry");

        let d1 = offset_from(&after_first.last_attempt.unwrap(), &retry1);
        let d2 = offset_from(&after_second.last_attempt.unwrap(), &retry2);
        assert!(d2 >= d1, "backoff must be monotonic: {d1:?} then {d2:?}");
        assert!(d1 >= Duration::from_millis(900) && d1 <= Duration::from_millis(1_500));
        assert!(d2 >= Duration::from_millis(1_900) && d2 <= Duration::from_millis(2_500));
    }

    #[test]
    fn attempt_at_cap_becomes_failed_permanent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());
        let err = serde_json::json!({"type": "http_error", "status_code": 503});

        let item = q.add(&record("x")).expect("add");
        for attempt in 1..=5 {
            force_next_retry(&q, &item.id, &now_iso());
            q.mark_sending(&item.id).expect("sending");
            let status = q.mark_failed(&item.id, &err).expect("failed");
            if attempt < 5 {
                assert_eq!(status, ItemStatus::Pending, "attempt {attempt}");
            } else {
                assert_eq!(status, ItemStatus::FailedPermanent);
            }
        }

        let current = q.get(&item.id).expect("get").expect("item");
        assert_eq!(current.status, ItemStatus::FailedPermanent);
        assert_eq!(current.attempts, 5);
        assert!(q.retryable().expect("retryable").is_empty());
    }

    #[test]
    fn backoff_saturates_at_max_delay_without_overflow() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        };
        assert_eq!(policy.delay_after(0), Duration::from_secs(1));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(9), Duration::from_secs(256));
        assert_eq!(policy.delay_after(10), Duration::from_secs(300));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn mark_permanent_failure_is_direct_and_pins_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let item = q.add(&record("x")).expect("add");
        q.mark_sending(&item.id).expect("sending");
        q.mark_permanent_failure(&item.id, &serde_json::json!({"type": "http_error", "status_code": 400}))
            .expect("permanent");

        let current = q.get(&item.id).expect("get").expect("item");
        assert_eq!(current.status, ItemStatus::FailedPermanent);
        assert_eq!(current.attempts, 5);
        assert!(current.last_error.as_deref().unwrap_or("").contains("400"));
    }

    #[test]
    fn reset_attempts_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let item = q.add(&record("x")).expect("add");
        q.mark_sending(&item.id).expect("sending");
        q.mark_permanent_failure(&item.id, &serde_json::json!({"type": "http_error"}))
            .expect("permanent");

        q.reset_attempts(&item.id).expect("reset");
        let once = q.get(&item.id).expect("get").expect("item");
        q.reset_attempts(&item.id).expect("reset again");
        let twice = q.get(&item.id).expect("get").expect("item");

        assert_eq!(once.status, ItemStatus::Pending);
        assert_eq!(once.attempts, 0);
        assert!(once.last_error.is_none());
        assert!(once.next_retry.is_none());
        // Two consecutive resets leave the item identical to one reset.
        assert_eq!(format!("{once:?}"), format!("{twice:?}"));
    }

    #[test]
    fn retryable_honours_backoff_eligibility() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let item = q.add(&record("x")).expect("add");
        q.mark_sending(&item.id).expect("sending");
        q.mark_failed(&item.id, &serde_json::json!({"type": "timeout"}))
            .expect("failed");

        // Backoff of 1 s has not elapsed.
        assert!(q.retryable().expect("retryable").is_empty());

        force_next_retry(&q, &item.id, &now_iso());
        let eligible = q.retryable().expect("retryable");
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, item.id);
    }

    #[test]
    fn cleanup_removes_only_old_sent_items() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let sent_old = q.add(&record("old")).expect("add");
        q.mark_sending(&sent_old.id).expect("sending");
        q.mark_sent(&sent_old.id, None).expect("sent");
        // Age the sent_at stamp by 40 days.
        let aged = (Utc::now() - chrono::Duration::days(40))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        {
            let conn = q.conn.lock();
            conn.execute(
                "UPDATE transcript_queue SET sent_at = ?1 WHERE id = ?2",
                params![aged, sent_old.id],
            )
            .expect("age item");
        }

        let sent_fresh = q.add(&record("fresh")).expect("add");
        q.mark_sending(&sent_fresh.id).expect("sending");
        q.mark_sent(&sent_fresh.id, None).expect("sent");

        let pending = q.add(&record("pending")).expect("add");

        let removed = q.cleanup(30).expect("cleanup");
        assert_eq!(removed, 1);
        assert!(q.get(&sent_old.id).expect("get").is_none());
        assert!(q.get(&sent_fresh.id).expect("get").is_some());
        assert!(q.get(&pending.id).expect("get").is_some());
    }

    #[test]
    fn startup_sweep_recovers_sending_items() {
        let dir = tempfile::tempdir().expect("tempdir");

        let id = {
            let q = queue(dir.path());
            let item = q.add(&record("in flight")).expect("add");
            q.mark_sending(&item.id).expect("sending");
            item.id
        };

        // Re-open simulates a restart after a crash mid-send.
        let q = queue(dir.path());
        let recovered = q.recover_orphans().expect("sweep");
        assert_eq!(recovered, 1);

        let item = q.get(&id).expect("get").expect("item");
        assert_eq!(item.status, ItemStatus::Pending);
        // Attempts are preserved; the item reenters via the retry path.
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn round_trip_appears_exactly_once_under_sent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(dir.path());

        let item = q.add(&record("hello world")).expect("add");
        q.mark_sending(&item.id).expect("sending");
        q.mark_sent(&item.id, Some(&serde_json::json!({"ok": true})))
            .expect("sent");

        let stats = q.stats().expect("stats");
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed_permanent, 0);
        assert_eq!(stats.total, 1);
    }

    fn force_next_retry(q: &TranscriptQueue, id: &str, when: &str) {
        let conn = q.conn.lock();
        conn.execute(
            "UPDATE transcript_queue SET next_retry = ?1 WHERE id = ?2",
            params![when, id],
        )
        .expect("force next_retry");
    }

    fn offset_from(start: &str, end: &str) -> Duration {
        let start = chrono::DateTime::parse_from_rfc3339(start).expect("start");
        let end = chrono::DateTime::parse_from_rfc3339(end).expect("end");
        (end - start).to_std().unwrap_or_default()
    }
}
