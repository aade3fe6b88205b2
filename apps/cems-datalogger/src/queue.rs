use crate::time::is_older_than_backdate_limit;
use crate::uplink::{is_success_body, parse_reply_status, UplinkClient};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const QUEUE_CAPACITY: usize = 100;
/// Upstream reply status meaning "failed, try again later".
const SERVER_FAILED_STATUS: i64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub encrypted_payload: String,
    /// ISO-8601 creation time, site timezone.
    pub timestamp: String,
    #[serde(default)]
    pub aligned_ts: Option<i64>,
}

/// Bounded FIFO of payloads awaiting resubmission. Every mutation rewrites
/// the whole file via temp + rename on the blocking pool, then swaps the
/// in-memory list. `write` serialises mutations so file and memory agree.
#[derive(Debug)]
pub struct RetryQueue {
    path: PathBuf,
    capacity: usize,
    items: Mutex<Vec<QueueItem>>,
    write: tokio::sync::Mutex<()>,
}

impl RetryQueue {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, QUEUE_CAPACITY)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let items = if path.exists() {
            match read_queue(&path) {
                Ok(mut items) => {
                    trim_to_capacity(&mut items, capacity);
                    items
                }
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "queue file unreadable; starting empty");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        tracing::info!(path = %path.display(), queued = items.len(), "retry queue loaded");
        Self {
            path,
            capacity: capacity.max(1),
            items: Mutex::new(items),
            write: tokio::sync::Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn front(&self) -> Option<QueueItem> {
        self.items.lock().ok().and_then(|items| items.first().cloned())
    }

    #[cfg(test)]
    pub fn items(&self) -> Vec<QueueItem> {
        self.items.lock().map(|items| items.clone()).unwrap_or_default()
    }

    /// Append at the tail, evicting the oldest entries beyond capacity.
    pub async fn push(&self, item: QueueItem) -> Result<()> {
        let capacity = self.capacity;
        self.mutate(move |items| {
            items.push(item);
            let evicted = trim_to_capacity(items, capacity);
            if evicted > 0 {
                tracing::warn!(evicted, "retry queue full; oldest items evicted");
            }
            true
        })
        .await
        .map(|_| ())
    }

    /// Remove the first entry equal to `item`. Returns whether one was found.
    pub async fn remove(&self, item: &QueueItem) -> Result<bool> {
        self.mutate(|items| match items.iter().position(|queued| queued == item) {
            Some(idx) => {
                items.remove(idx);
                true
            }
            None => false,
        })
        .await
    }

    /// Apply `change` to a copy, persist it when it reports a change, then swap it in.
    async fn mutate(&self, change: impl FnOnce(&mut Vec<QueueItem>) -> bool) -> Result<bool> {
        let _write = self.write.lock().await;
        let mut next = self
            .items
            .lock()
            .map_err(|_| anyhow::anyhow!("queue lock poisoned"))?
            .clone();
        if !change(&mut next) {
            return Ok(false);
        }
        let path = self.path.clone();
        let next = tokio::task::spawn_blocking(move || persist_queue(&path, &next).map(|()| next))
            .await
            .context("queue persist task")??;
        let mut items = self
            .items
            .lock()
            .map_err(|_| anyhow::anyhow!("queue lock poisoned"))?;
        *items = next;
        Ok(true)
    }
}

fn trim_to_capacity(items: &mut Vec<QueueItem>, capacity: usize) -> usize {
    let excess = items.len().saturating_sub(capacity.max(1));
    if excess > 0 {
        items.drain(..excess);
    }
    excess
}

fn read_queue(path: &Path) -> Result<Vec<QueueItem>> {
    let raw = fs::read_to_string(path).context("read queue file")?;
    serde_json::from_str(&raw).context("parse queue file")
}

fn persist_queue(path: &Path, items: &[QueueItem]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(items)?;
    fs::write(&tmp, json).context("write queue tmp")?;
    fs::rename(&tmp, path).context("rename queue file")?;
    Ok(())
}

/// What the worker does with the head item after one upstream answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainStep {
    Delivered,
    /// 200 with a malformed or rejecting body: drop it, it will never pass.
    Rejected,
    /// Stop the drain and keep this item and everything behind it.
    Hold(String),
}

pub fn classify_drain(status: u16, body: &str) -> DrainStep {
    if status != 200 {
        return DrainStep::Hold(format!("Status {status}: {}", body.trim()));
    }
    if is_success_body(body) {
        return DrainStep::Delivered;
    }
    if parse_reply_status(body) == Some(SERVER_FAILED_STATUS) {
        return DrainStep::Hold(format!("server reported failure: {}", body.trim()));
    }
    DrainStep::Rejected
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub delivered: usize,
    pub rejected: usize,
    pub expired: usize,
    pub held: Option<String>,
}

/// Single-flight drainer for the retry queue.
pub struct QueueWorker {
    queue: Arc<RetryQueue>,
    uplink: UplinkClient,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl QueueWorker {
    pub fn new(queue: Arc<RetryQueue>, uplink: UplinkClient) -> Self {
        Self {
            queue,
            uplink,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start a background drain unless one is already in flight.
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self.queue.is_empty() || self.is_running() {
            return false;
        }
        let worker = self.clone();
        tokio::spawn(async move {
            if let Some(summary) = worker.drain_once().await {
                tracing::info!(
                    delivered = summary.delivered,
                    rejected = summary.rejected,
                    expired = summary.expired,
                    held = ?summary.held,
                    remaining = worker.queue.len(),
                    "retry queue drain finished"
                );
            }
        });
        true
    }

    /// Drain from the head until empty or a hold. `None` when another drain
    /// is already running.
    pub async fn drain_once(&self) -> Option<DrainSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _guard = RunningGuard(&self.running);
        let mut summary = DrainSummary::default();

        while let Some(item) = self.queue.front() {
            if item
                .aligned_ts
                .is_some_and(|ts| is_older_than_backdate_limit(ts, Utc::now()))
            {
                tracing::info!(created = %item.timestamp, "queued payload past backdate limit; discarded");
                self.remove(&item).await;
                summary.expired += 1;
                continue;
            }

            let step = match self.uplink.post_encrypted(&item.encrypted_payload).await {
                Ok((status, body)) => {
                    tracing::info!(status, body = %body.trim(), created = %item.timestamp, "queued payload answered");
                    classify_drain(status, &body)
                }
                Err(err) => DrainStep::Hold(err.to_string()),
            };

            match step {
                DrainStep::Delivered => {
                    self.remove(&item).await;
                    summary.delivered += 1;
                }
                DrainStep::Rejected => {
                    tracing::error!(created = %item.timestamp, "queued payload rejected; dropped");
                    self.remove(&item).await;
                    summary.rejected += 1;
                }
                DrainStep::Hold(reason) => {
                    tracing::warn!(reason = %reason, "retry queue drain paused");
                    summary.held = Some(reason);
                    break;
                }
            }
        }
        Some(summary)
    }

    async fn remove(&self, item: &QueueItem) {
        if let Err(err) = self.queue.remove(item).await {
            tracing::error!(error = %err, "failed to persist queue removal");
        }
    }
}
