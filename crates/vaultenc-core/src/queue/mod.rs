//! FIFO work queue with per-item retry metadata, JSON snapshot persistence, and DLQ
//! promotion.
//!
//! A single `parking_lot::Mutex` guards the `VecDeque`; items that are retry-gated stay in
//! place rather than being pulled to the front, so a later, ready item can overtake one
//! that is still waiting out its backoff.

use std::collections::VecDeque;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work item {0} is already queued")]
    Duplicate(String),
    #[error("failed to persist queue snapshot: {0}")]
    Persist(#[source] std::io::Error),
    #[error("failed to parse queue snapshot: {0}")]
    Deserialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub operation: OperationKind,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub key_path: Option<PathBuf>,
    pub checksum_path: Option<PathBuf>,
    pub status: WorkStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source_size: u64,
    pub checksum: Option<String>,
}

impl WorkItem {
    pub fn new(operation: OperationKind, source_path: PathBuf, dest_path: PathBuf, source_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            source_path,
            dest_path,
            key_path: None,
            checksum_path: None,
            status: WorkStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
            source_size,
            checksum: None,
        }
    }
}

/// Backoff policy shared by the queue's `requeue` and the KMS client's internal retry.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `-1` (stored as `None`) means unbounded retries.
    pub max_retries: Option<u32>,
}

impl BackoffPolicy {
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        scaled.min(self.max_delay)
    }

    #[must_use]
    pub fn exceeds_budget(&self, attempt_count: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt_count > max,
            None => false,
        }
    }
}

pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    backoff: BackoffPolicy,
}

impl WorkQueue {
    #[must_use]
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            backoff,
        }
    }

    pub fn enqueue(&self, item: WorkItem) -> Result<(), QueueError> {
        let mut items = self.items.lock();
        if items.iter().any(|existing| existing.id == item.id) {
            return Err(QueueError::Duplicate(item.id));
        }
        items.push_back(item);
        Ok(())
    }

    /// Remove and return the first item that is ready (`next_retry_at` is unset or in the
    /// past) and not dead-lettered. Items it skips over keep their queue position.
    pub fn dequeue(&self) -> Option<WorkItem> {
        let mut items = self.items.lock();
        let now = Utc::now();
        let ready_index = items.iter().position(|item| {
            item.status != WorkStatus::DeadLetter && item.next_retry_at.is_none_or(|t| t <= now)
        })?;
        items.remove(ready_index)
    }

    /// Record a failed attempt: bump the attempt count, compute the next retry delay, and
    /// either re-admit the item as `failed` or promote it to `dead_letter`.
    #[instrument(level = "warn", skip(self, item), fields(id = %item.id, attempt = item.attempt_count + 1))]
    pub fn requeue(&self, mut item: WorkItem, error: &str) {
        item.attempt_count += 1;
        item.last_attempt_at = Some(Utc::now());
        item.last_error = Some(error.to_string());

        if self.backoff.exceeds_budget(item.attempt_count) {
            item.status = WorkStatus::DeadLetter;
            item.next_retry_at = None;
            warn!(id = %item.id, attempts = item.attempt_count, "item exceeded retry budget, moved to dead letter");
        } else {
            item.status = WorkStatus::Failed;
            let delay = self.backoff.delay_for_attempt(item.attempt_count);
            item.next_retry_at = Some(Utc::now() + delay);
        }

        self.items.lock().push_back(item);
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn list(&self) -> Vec<WorkItem> {
        self.items.lock().iter().cloned().collect()
    }

    /// Atomically write a JSON snapshot: write to `path.tmp`, `fsync`, rename over `path`.
    #[instrument(level = "info", skip(self))]
    pub fn save(&self, path: &Path) -> Result<(), QueueError> {
        let items = self.list();
        let json = serde_json::to_vec_pretty(&items).map_err(QueueError::Deserialize)?;

        let tmp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp_path).map_err(QueueError::Persist)?;
        file.write_all(&json).map_err(QueueError::Persist)?;
        file.sync_all().map_err(QueueError::Persist)?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600));
        }

        std::fs::rename(&tmp_path, path).map_err(QueueError::Persist)?;
        info!(count = items.len(), path = %path.display(), "saved queue snapshot");
        Ok(())
    }

    /// Load a JSON snapshot. A missing file yields an empty queue, not an error.
    #[instrument(level = "info", skip(self))]
    pub fn load(&self, path: &Path) -> Result<(), QueueError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no queue snapshot found, starting empty");
                return Ok(());
            }
            Err(e) => return Err(QueueError::Persist(e)),
        };
        let loaded: Vec<WorkItem> = serde_json::from_slice(&bytes).map_err(QueueError::Deserialize)?;
        let mut items = self.items.lock();
        items.clear();
        items.extend(loaded);
        Ok(())
    }
}
