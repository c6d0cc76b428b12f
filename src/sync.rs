//! Resumable chat-history synchronization
//!
//! A single worker walks enrolled chats one at a time, pulling history pages
//! newest-first from the upstream account and pushing batches to the search
//! engine. Progress is checkpointed to disk after every confirmed batch, so
//! a crash loses at most one batch of work; idempotent upserts make the
//! re-fetch on restart safe.

use crate::buffered::{BatchSink, BufferedIndexer};
use crate::config::SyncConfig;
use crate::document::MessageDocument;
use crate::types::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upstream history reader. The real implementation wraps the user-account
/// client; tests use scripted sources.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Total number of messages in the chat, fetched once per sync.
    async fn message_count(&self, chat_id: i64) -> Result<u64>;

    /// Fetch up to `limit` messages strictly older than `offset_id`
    /// (`0` means start from the newest), ordered newest first. An empty
    /// page ends the stream.
    async fn fetch_older(
        &self,
        chat_id: i64,
        offset_id: i32,
        limit: usize,
    ) -> Result<Vec<MessageDocument>>;
}

/// Per-chat sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Paused => "paused",
        }
    }
}

/// Progress record for one chat, persisted in the checkpoint file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub chat_id: i64,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub synced_count: u64,
    #[serde(default)]
    pub last_message_id: Option<i32>,
    pub status: SyncStatus,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub last_checkpoint: Option<String>,
    #[serde(default)]
    pub progress_percent: f64,
}

impl SyncProgress {
    pub fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            total_count: 0,
            synced_count: 0,
            last_message_id: None,
            status: SyncStatus::Pending,
            error_count: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
            last_checkpoint: None,
            progress_percent: 0.0,
        }
    }

    fn update_percent(&mut self) {
        self.progress_percent = if self.total_count > 0 {
            (self.synced_count as f64 / self.total_count as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
    }
}

/// Queue-level summary across all enrolled chats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub total_chats: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub pending: usize,
    pub paused: usize,
    pub total_messages: u64,
    pub synced_messages: u64,
    pub progress_percent: f64,
    pub current_chat_id: Option<i64>,
}

/// Outcome of enrolling a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enrollment {
    Added,
    Conflict(SyncStatus),
}

/// On-disk checkpoint shape.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    last_updated: String,
    chats: Vec<SyncProgress>,
}

struct SyncState {
    progress: BTreeMap<i64, SyncProgress>,
    current: Option<i64>,
}

/// Progress callback invoked after each confirmed batch and at completion.
pub type ProgressCallback = dyn Fn(&SyncProgress) + Send + Sync;

/// Resume-capable sync queue with a single sequential worker.
pub struct SyncManager {
    source: Arc<dyn HistorySource>,
    sink: Arc<dyn BatchSink>,
    /// Shared live indexer, drained defensively when a chat completes.
    indexer: Option<BufferedIndexer>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    running: AtomicBool,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        source: Arc<dyn HistorySource>,
        sink: Arc<dyn BatchSink>,
        indexer: Option<BufferedIndexer>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            sink,
            indexer,
            config,
            state: Mutex::new(SyncState {
                progress: BTreeMap::new(),
                current: None,
            }),
            running: AtomicBool::new(false),
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Load the checkpoint from disk. Completed records are retained (or
    /// pruned per config); anything else is coerced to pending so the worker
    /// picks it up.
    pub async fn load_checkpoint(&self) -> Result<()> {
        if !self.config.resume_on_restart || !self.config.checkpoint_file.exists() {
            info!("no checkpoint found or resume disabled, starting fresh");
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.config.checkpoint_file).await?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("corrupt checkpoint file: {}", e)))?;

        let mut state = self.state.lock().await;
        for mut progress in checkpoint.chats {
            if progress.status == SyncStatus::Completed {
                if self.config.clear_completed {
                    continue;
                }
            } else {
                info!(
                    chat_id = progress.chat_id,
                    synced = progress.synced_count,
                    total = progress.total_count,
                    "resuming sync"
                );
                progress.status = SyncStatus::Pending;
            }
            state.progress.insert(progress.chat_id, progress);
        }
        info!(chats = state.progress.len(), "checkpoint loaded");
        Ok(())
    }

    /// Persist the current progress map atomically (tempfile + rename).
    async fn save_checkpoint(&self) -> Result<()> {
        let checkpoint = {
            let state = self.state.lock().await;
            Checkpoint {
                last_updated: Utc::now().to_rfc3339(),
                chats: state.progress.values().cloned().collect(),
            }
        };

        let serialized = serde_json::to_string_pretty(&checkpoint)?;
        let tmp = self.config.checkpoint_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &self.config.checkpoint_file).await?;
        debug!(chats = checkpoint.chats.len(), "checkpoint saved");
        Ok(())
    }

    /// Enroll a chat. Completed chats reset to pending (user-requested
    /// re-sync); chats in any other state are rejected with their status.
    pub async fn add_chat(&self, chat_id: i64) -> Result<Enrollment> {
        let enrollment = {
            let mut state = self.state.lock().await;
            match state.progress.get(&chat_id) {
                Some(existing) if existing.status == SyncStatus::Completed => {
                    info!(chat_id, "chat already fully synced, re-enrolling");
                    state.progress.insert(chat_id, SyncProgress::new(chat_id));
                    Enrollment::Added
                }
                Some(existing) => {
                    info!(chat_id, status = existing.status.as_str(), "chat already queued");
                    Enrollment::Conflict(existing.status)
                }
                None => {
                    state.progress.insert(chat_id, SyncProgress::new(chat_id));
                    info!(chat_id, "chat enrolled for sync");
                    Enrollment::Added
                }
            }
        };
        if enrollment == Enrollment::Added {
            self.save_checkpoint().await?;
        }
        Ok(enrollment)
    }

    /// Pause a pending or in-progress chat. An in-progress sync notices at
    /// the next batch boundary.
    pub async fn pause_chat(&self, chat_id: i64) -> Result<bool> {
        let paused = {
            let mut state = self.state.lock().await;
            match state.progress.get_mut(&chat_id) {
                Some(p) if matches!(p.status, SyncStatus::Pending | SyncStatus::InProgress) => {
                    p.status = SyncStatus::Paused;
                    true
                }
                Some(p) => {
                    warn!(chat_id, status = p.status.as_str(), "cannot pause");
                    false
                }
                None => {
                    warn!(chat_id, "cannot pause: not in sync queue");
                    false
                }
            }
        };
        if paused {
            self.save_checkpoint().await?;
            info!(chat_id, "sync paused");
        }
        Ok(paused)
    }

    /// Flip a paused chat back to pending; the worker will pick it up.
    pub async fn resume_chat(&self, chat_id: i64) -> Result<bool> {
        let resumed = {
            let mut state = self.state.lock().await;
            match state.progress.get_mut(&chat_id) {
                Some(p) if p.status == SyncStatus::Paused => {
                    p.status = SyncStatus::Pending;
                    true
                }
                Some(p) => {
                    warn!(chat_id, status = p.status.as_str(), "cannot resume");
                    false
                }
                None => {
                    warn!(chat_id, "cannot resume: not in sync queue");
                    false
                }
            }
        };
        if resumed {
            self.save_checkpoint().await?;
            info!(chat_id, "sync resumed");
        }
        Ok(resumed)
    }

    pub async fn get_progress(&self, chat_id: i64) -> Option<SyncProgress> {
        self.state.lock().await.progress.get(&chat_id).cloned()
    }

    pub async fn get_all_progress(&self) -> Vec<SyncProgress> {
        self.state.lock().await.progress.values().cloned().collect()
    }

    pub async fn get_summary(&self) -> SyncSummary {
        let state = self.state.lock().await;
        let count = |s: SyncStatus| state.progress.values().filter(|p| p.status == s).count();
        let total_messages: u64 = state.progress.values().map(|p| p.total_count).sum();
        let synced_messages: u64 = state.progress.values().map(|p| p.synced_count).sum();
        SyncSummary {
            total_chats: state.progress.len(),
            completed: count(SyncStatus::Completed),
            in_progress: count(SyncStatus::InProgress),
            failed: count(SyncStatus::Failed),
            pending: count(SyncStatus::Pending),
            paused: count(SyncStatus::Paused),
            total_messages,
            synced_messages,
            progress_percent: if total_messages > 0 {
                (synced_messages as f64 / total_messages as f64 * 10_000.0).round() / 100.0
            } else {
                0.0
            },
            current_chat_id: state.current,
        }
    }

    /// Remove completed records from the map and the checkpoint.
    pub async fn clear_completed(&self) -> Result<usize> {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.progress.len();
            state.progress.retain(|_, p| p.status != SyncStatus::Completed);
            before - state.progress.len()
        };
        self.save_checkpoint().await?;
        info!(removed, "cleared completed chats from sync queue");
        Ok(removed)
    }

    /// Apply a mutation to one progress record and refresh its percent.
    async fn with_progress<F: FnOnce(&mut SyncProgress)>(&self, chat_id: i64, f: F) {
        let mut state = self.state.lock().await;
        if let Some(p) = state.progress.get_mut(&chat_id) {
            f(p);
            p.update_percent();
        }
    }

    async fn status_of(&self, chat_id: i64) -> Option<SyncStatus> {
        self.state.lock().await.progress.get(&chat_id).map(|p| p.status)
    }

    /// Synchronize one chat on the calling task. Returns `Ok(true)` when the
    /// chat reached `completed`.
    pub async fn sync_chat(
        &self,
        chat_id: i64,
        progress_cb: Option<&ProgressCallback>,
    ) -> Result<bool> {
        {
            let mut state = self.state.lock().await;
            state
                .progress
                .entry(chat_id)
                .or_insert_with(|| SyncProgress::new(chat_id));
        }

        self.with_progress(chat_id, |p| {
            p.status = SyncStatus::InProgress;
            if p.started_at.is_none() {
                p.started_at = Some(Utc::now().to_rfc3339());
            }
        })
        .await;
        self.save_checkpoint().await?;

        // Fetch the total once; a failure here fails the chat.
        let needs_total = self
            .get_progress(chat_id)
            .await
            .map(|p| p.total_count == 0)
            .unwrap_or(true);
        if needs_total {
            match self.source.message_count(chat_id).await {
                Ok(total) => {
                    info!(chat_id, total, "chat message count fetched");
                    self.with_progress(chat_id, |p| p.total_count = total).await;
                }
                Err(e) => {
                    error!(chat_id, "failed to get message count: {}", e);
                    self.with_progress(chat_id, |p| {
                        p.last_error = Some(e.to_string());
                        p.status = SyncStatus::Failed;
                    })
                    .await;
                    self.save_checkpoint().await?;
                    return Ok(false);
                }
            }
        }

        let mut offset_id = self
            .get_progress(chat_id)
            .await
            .and_then(|p| p.last_message_id)
            .unwrap_or(0);

        info!(chat_id, offset_id, "starting sync");

        loop {
            // Cooperative pause: honored at every batch boundary.
            if self.status_of(chat_id).await == Some(SyncStatus::Paused) {
                info!(chat_id, "sync paused at batch boundary");
                self.save_checkpoint().await?;
                return Ok(false);
            }

            let page = match self
                .source
                .fetch_older(chat_id, offset_id, self.config.batch_size)
                .await
            {
                Ok(page) => page,
                Err(Error::RateLimited { wait_seconds }) => {
                    // Upstream flood control: pause, wait it out, retry the
                    // same iteration.
                    warn!(chat_id, wait_seconds, "rate limited, pausing sync");
                    self.with_progress(chat_id, |p| {
                        p.status = SyncStatus::Paused;
                        p.last_error = Some(format!("FloodWait: {}s", wait_seconds));
                    })
                    .await;
                    self.save_checkpoint().await?;
                    tokio::time::sleep(Duration::from_secs(wait_seconds)).await;
                    self.with_progress(chat_id, |p| p.status = SyncStatus::InProgress)
                        .await;
                    continue;
                }
                Err(Error::PermissionDenied(reason)) => {
                    error!(chat_id, %reason, "permission denied, not retrying");
                    self.with_progress(chat_id, |p| {
                        p.status = SyncStatus::Failed;
                        p.last_error = Some(reason.clone());
                    })
                    .await;
                    self.save_checkpoint().await?;
                    return Ok(false);
                }
                Err(e) => {
                    if self.record_error(chat_id, &e).await? {
                        return Ok(false);
                    }
                    continue;
                }
            };

            if page.is_empty() {
                break;
            }
            let last_id = page.last().map(|d| d.message_id).unwrap_or(offset_id);
            let page_len = page.len();

            match self.sink.upsert_batch(page).await {
                Ok(outcome) => {
                    self.with_progress(chat_id, |p| {
                        p.synced_count += outcome.indexed_count;
                        p.last_message_id = Some(last_id);
                        p.last_checkpoint = Some(Utc::now().to_rfc3339());
                        if outcome.failed_count > 0 {
                            p.error_count += outcome.failed_count as u32;
                            p.last_error =
                                Some(format!("batch had {} failures", outcome.failed_count));
                        }
                    })
                    .await;
                    self.save_checkpoint().await?;

                    if let Some(cb) = progress_cb
                        && let Some(p) = self.get_progress(chat_id).await
                    {
                        cb(&p);
                    }

                    if let Some(p) = self.get_progress(chat_id).await {
                        info!(
                            chat_id,
                            synced = p.synced_count,
                            total = p.total_count,
                            percent = p.progress_percent,
                            indexed = outcome.indexed_count,
                            batch = page_len,
                            "batch indexed"
                        );
                    }
                }
                Err(e) => {
                    if self.record_error(chat_id, &e).await? {
                        return Ok(false);
                    }
                    continue;
                }
            }

            offset_id = last_id;

            if self.config.delay_between_batches > 0.0 {
                debug!(
                    chat_id,
                    delay = self.config.delay_between_batches,
                    "sleeping between batches"
                );
                tokio::time::sleep(Duration::from_secs_f64(self.config.delay_between_batches))
                    .await;
            }
        }

        // History exhausted: drain the shared live indexer defensively, then
        // mark the chat completed.
        if let Some(indexer) = &self.indexer
            && let Err(e) = indexer.flush().await
        {
            warn!(chat_id, "indexer flush after sync failed: {}", e);
        }

        self.with_progress(chat_id, |p| {
            p.status = SyncStatus::Completed;
            p.completed_at = Some(Utc::now().to_rfc3339());
        })
        .await;
        self.save_checkpoint().await?;

        if let Some(cb) = progress_cb
            && let Some(p) = self.get_progress(chat_id).await
        {
            cb(&p);
        }

        if let Some(p) = self.get_progress(chat_id).await {
            info!(chat_id, synced = p.synced_count, "sync completed");
        }
        Ok(true)
    }

    /// Count an error against the chat. Returns `true` when the retry budget
    /// is exhausted and the chat was marked failed.
    async fn record_error(&self, chat_id: i64, e: &Error) -> Result<bool> {
        error!(chat_id, "error during sync: {}", e);
        let retry_on_error = self.config.retry_on_error;
        let max_retries = self.config.max_retries;
        let mut exhausted = false;
        self.with_progress(chat_id, |p| {
            p.error_count += 1;
            p.last_error = Some(e.to_string());
            if !retry_on_error || p.error_count >= max_retries {
                p.status = SyncStatus::Failed;
                exhausted = true;
            }
        })
        .await;
        self.save_checkpoint().await?;
        if !exhausted {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(exhausted)
    }

    /// Start the single background worker processing pending chats one at a
    /// time.
    pub fn start_worker(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("sync worker already running");
            return;
        }
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("sync worker started");
            while manager.running.load(Ordering::SeqCst) {
                let next = {
                    let state = manager.state.lock().await;
                    state
                        .progress
                        .values()
                        .find(|p| p.status == SyncStatus::Pending)
                        .map(|p| p.chat_id)
                };

                match next {
                    Some(chat_id) => {
                        info!(chat_id, "worker picking up chat");
                        manager.state.lock().await.current = Some(chat_id);
                        if let Err(e) = manager.sync_chat(chat_id, None).await {
                            error!(chat_id, "worker sync error: {}", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        manager.state.lock().await.current = None;
                    }
                    None => tokio::time::sleep(Duration::from_secs(1)).await,
                }
            }
            info!("sync worker stopped");
        });
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(handle);
        }
    }

    /// Signal the worker to stop and join it, waiting up to 10 seconds.
    pub async fn stop_worker(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.worker.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(_) => info!("sync worker joined"),
                Err(_) => warn!("sync worker did not stop within 10s"),
            }
        }
    }

    pub fn is_worker_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ChatInfo, ChatType, SenderInfo};
    use crate::search_client::BatchOutcome;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    fn doc(chat_id: i64, message_id: i32) -> MessageDocument {
        MessageDocument {
            id: MessageDocument::composite_id(chat_id, message_id),
            message_id,
            text: format!("msg {}", message_id),
            caption: String::new(),
            chat: ChatInfo {
                id: chat_id,
                kind: ChatType::Supergroup,
                title: "chat".into(),
                username: String::new(),
            },
            from_user: SenderInfo::default(),
            sender_chat: None,
            date: message_id as i64,
            timestamp: message_id as i64,
            entities: Vec::new(),
            is_deleted: false,
            deleted_at: 0,
        }
    }

    /// Scripted history: message ids `1..=total`, served newest-first.
    struct ScriptedSource {
        total: u64,
        rate_limit_once: Mutex<Option<u64>>,
        fail_permission: bool,
        transient_failures: Mutex<u32>,
    }

    impl ScriptedSource {
        fn new(total: u64) -> Arc<Self> {
            Arc::new(Self {
                total,
                rate_limit_once: Mutex::new(None),
                fail_permission: false,
                transient_failures: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl HistorySource for ScriptedSource {
        async fn message_count(&self, _chat_id: i64) -> Result<u64> {
            Ok(self.total)
        }

        async fn fetch_older(
            &self,
            chat_id: i64,
            offset_id: i32,
            limit: usize,
        ) -> Result<Vec<MessageDocument>> {
            if self.fail_permission {
                return Err(Error::PermissionDenied("Channel is private".into()));
            }
            if let Some(wait) = self.rate_limit_once.lock().await.take() {
                return Err(Error::RateLimited { wait_seconds: wait });
            }
            {
                let mut failures = self.transient_failures.lock().await;
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Error::Search("engine hiccup".into()));
                }
            }
            let newest = if offset_id == 0 {
                self.total as i32
            } else {
                offset_id - 1
            };
            if newest < 1 {
                return Ok(Vec::new());
            }
            let oldest = (newest - limit as i32 + 1).max(1);
            Ok((oldest..=newest).rev().map(|id| doc(chat_id, id)).collect())
        }
    }

    struct CountingSink {
        indexed: AtomicU64,
        batches: Mutex<Vec<usize>>,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                indexed: AtomicU64::new(0),
                batches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BatchSink for CountingSink {
        async fn upsert_batch(&self, docs: Vec<MessageDocument>) -> Result<BatchOutcome> {
            self.indexed.fetch_add(docs.len() as u64, Ordering::SeqCst);
            self.batches.lock().await.push(docs.len());
            Ok(BatchOutcome {
                indexed_count: docs.len() as u64,
                failed_count: 0,
                errors: Vec::new(),
            })
        }
    }

    fn manager(
        dir: &TempDir,
        source: Arc<dyn HistorySource>,
        sink: Arc<dyn BatchSink>,
        batch_size: usize,
        overrides: impl FnOnce(&mut SyncConfig),
    ) -> Arc<SyncManager> {
        let mut config = SyncConfig {
            checkpoint_file: dir.path().join("checkpoint.json"),
            batch_size,
            delay_between_batches: 0.0,
            ..Default::default()
        };
        overrides(&mut config);
        Arc::new(SyncManager::new(source, sink, None, config))
    }

    #[tokio::test]
    async fn test_full_sync_completes_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let sink = CountingSink::new();
        let m = manager(&dir, ScriptedSource::new(250), sink.clone(), 100, |_| {});

        m.add_chat(-1001).await.unwrap();
        assert!(m.sync_chat(-1001, None).await.unwrap());

        let progress = m.get_progress(-1001).await.unwrap();
        assert_eq!(progress.status, SyncStatus::Completed);
        assert_eq!(progress.synced_count, 250);
        assert_eq!(progress.total_count, 250);
        assert_eq!(progress.progress_percent, 100.0);
        assert!(progress.completed_at.is_some());
        assert!(progress.last_checkpoint.is_some());
        assert_eq!(sink.indexed.load(Ordering::SeqCst), 250);
        assert_eq!(*sink.batches.lock().await, vec![100, 100, 50]);
        assert!(dir.path().join("checkpoint.json").exists());
    }

    #[tokio::test]
    async fn test_resume_after_crash_indexes_remaining() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");

        // A crashed run: 200 of 250 synced, checkpointed at message id 51
        // (newest-first walk: batches 250..151 and 150..51 confirmed).
        let mut crashed = SyncProgress::new(-1001);
        crashed.total_count = 250;
        crashed.synced_count = 200;
        crashed.last_message_id = Some(51);
        crashed.status = SyncStatus::InProgress;
        crashed.started_at = Some(Utc::now().to_rfc3339());
        let checkpoint = Checkpoint {
            last_updated: Utc::now().to_rfc3339(),
            chats: vec![crashed],
        };
        std::fs::write(&path, serde_json::to_string(&checkpoint).unwrap()).unwrap();

        let sink = CountingSink::new();
        let m = manager(&dir, ScriptedSource::new(250), sink.clone(), 100, |_| {});
        m.load_checkpoint().await.unwrap();

        let progress = m.get_progress(-1001).await.unwrap();
        assert_eq!(progress.status, SyncStatus::Pending);
        assert_eq!(progress.last_message_id, Some(51));

        assert!(m.sync_chat(-1001, None).await.unwrap());
        let progress = m.get_progress(-1001).await.unwrap();
        assert_eq!(progress.status, SyncStatus::Completed);
        assert_eq!(progress.synced_count, 250);
        // Only the remaining 50 messages were fetched and indexed.
        assert_eq!(sink.indexed.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_add_chat_conflicts_and_resync() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, ScriptedSource::new(5), CountingSink::new(), 10, |_| {});

        assert_eq!(m.add_chat(-1).await.unwrap(), Enrollment::Added);
        assert_eq!(
            m.add_chat(-1).await.unwrap(),
            Enrollment::Conflict(SyncStatus::Pending)
        );

        m.sync_chat(-1, None).await.unwrap();
        // Completed chats can be re-enrolled.
        assert_eq!(m.add_chat(-1).await.unwrap(), Enrollment::Added);
        let p = m.get_progress(-1).await.unwrap();
        assert_eq!(p.status, SyncStatus::Pending);
        assert_eq!(p.synced_count, 0);
    }

    #[tokio::test]
    async fn test_empty_chat_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let sink = CountingSink::new();
        let m = manager(&dir, ScriptedSource::new(0), sink.clone(), 10, |_| {});

        m.add_chat(-1).await.unwrap();
        assert!(m.sync_chat(-1, None).await.unwrap());
        let p = m.get_progress(-1).await.unwrap();
        assert_eq!(p.status, SyncStatus::Completed);
        assert_eq!(p.synced_count, 0);
        assert_eq!(sink.indexed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_marks_failed() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource {
            total: 10,
            rate_limit_once: Mutex::new(None),
            fail_permission: true,
            transient_failures: Mutex::new(0),
        });
        let m = manager(&dir, source, CountingSink::new(), 10, |_| {});

        m.add_chat(-1).await.unwrap();
        assert!(!m.sync_chat(-1, None).await.unwrap());
        let p = m.get_progress(-1).await.unwrap();
        assert_eq!(p.status, SyncStatus::Failed);
        assert!(p.last_error.as_deref().unwrap().contains("private"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pauses_then_resumes() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource {
            total: 5,
            rate_limit_once: Mutex::new(Some(30)),
            fail_permission: false,
            transient_failures: Mutex::new(0),
        });
        let m = manager(&dir, source, CountingSink::new(), 10, |_| {});

        m.add_chat(-1).await.unwrap();
        // The paused-clock runtime advances through the FloodWait sleep.
        assert!(m.sync_chat(-1, None).await.unwrap());
        let p = m.get_progress(-1).await.unwrap();
        assert_eq!(p.status, SyncStatus::Completed);
        assert_eq!(p.synced_count, 5);
        assert!(p.last_error.as_deref().unwrap().starts_with("FloodWait"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_respect_retry_budget() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource {
            total: 5,
            rate_limit_once: Mutex::new(None),
            fail_permission: false,
            transient_failures: Mutex::new(2),
        });
        // Budget of 3: two hiccups are tolerated, sync still completes.
        let m = manager(&dir, source, CountingSink::new(), 10, |c| c.max_retries = 3);
        m.add_chat(-1).await.unwrap();
        assert!(m.sync_chat(-1, None).await.unwrap());
        let p = m.get_progress(-1).await.unwrap();
        assert_eq!(p.error_count, 2);
        assert_eq!(p.status, SyncStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_fails_chat() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource {
            total: 5,
            rate_limit_once: Mutex::new(None),
            fail_permission: false,
            transient_failures: Mutex::new(5),
        });
        let m = manager(&dir, source, CountingSink::new(), 10, |c| c.max_retries = 2);
        m.add_chat(-1).await.unwrap();
        assert!(!m.sync_chat(-1, None).await.unwrap());
        let p = m.get_progress(-1).await.unwrap();
        assert_eq!(p.status, SyncStatus::Failed);
        assert_eq!(p.error_count, 2);
    }

    #[tokio::test]
    async fn test_retry_disabled_fails_on_first_error() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource {
            total: 5,
            rate_limit_once: Mutex::new(None),
            fail_permission: false,
            transient_failures: Mutex::new(1),
        });
        let m = manager(&dir, source, CountingSink::new(), 10, |c| {
            c.retry_on_error = false;
        });
        m.add_chat(-1).await.unwrap();
        assert!(!m.sync_chat(-1, None).await.unwrap());
        assert_eq!(m.get_progress(-1).await.unwrap().status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_checkpoint_reload_coerces_states() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut in_progress = SyncProgress::new(-1);
        in_progress.status = SyncStatus::InProgress;
        in_progress.synced_count = 40;
        let mut completed = SyncProgress::new(-2);
        completed.status = SyncStatus::Completed;
        let checkpoint = Checkpoint {
            last_updated: Utc::now().to_rfc3339(),
            chats: vec![in_progress, completed],
        };
        std::fs::write(&path, serde_json::to_string(&checkpoint).unwrap()).unwrap();

        let m = manager(&dir, ScriptedSource::new(5), CountingSink::new(), 10, |_| {});
        m.load_checkpoint().await.unwrap();

        assert_eq!(m.get_progress(-1).await.unwrap().status, SyncStatus::Pending);
        assert_eq!(
            m.get_progress(-2).await.unwrap().status,
            SyncStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_checkpoint_reload_prunes_completed_when_configured() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut completed = SyncProgress::new(-2);
        completed.status = SyncStatus::Completed;
        let checkpoint = Checkpoint {
            last_updated: Utc::now().to_rfc3339(),
            chats: vec![completed],
        };
        std::fs::write(&path, serde_json::to_string(&checkpoint).unwrap()).unwrap();

        let m = manager(&dir, ScriptedSource::new(5), CountingSink::new(), 10, |c| {
            c.clear_completed = true;
        });
        m.load_checkpoint().await.unwrap();
        assert!(m.get_progress(-2).await.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip_preserves_enrollment() {
        let dir = TempDir::new().unwrap();
        {
            let m = manager(&dir, ScriptedSource::new(5), CountingSink::new(), 10, |_| {});
            m.add_chat(-1).await.unwrap();
            m.add_chat(-2).await.unwrap();
        }
        let m = manager(&dir, ScriptedSource::new(5), CountingSink::new(), 10, |_| {});
        m.load_checkpoint().await.unwrap();
        assert_eq!(m.get_progress(-1).await.unwrap().status, SyncStatus::Pending);
        assert_eq!(m.get_progress(-2).await.unwrap().status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_worker_processes_pending_sequentially() {
        let dir = TempDir::new().unwrap();
        let sink = CountingSink::new();
        let m = manager(&dir, ScriptedSource::new(30), sink.clone(), 10, |_| {});

        m.add_chat(-1).await.unwrap();
        m.add_chat(-2).await.unwrap();
        m.start_worker();

        for _ in 0..500 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if m.get_summary().await.completed == 2 {
                break;
            }
        }
        m.stop_worker().await;

        let summary = m.get_summary().await;
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.synced_messages, 60);
        assert!(summary.current_chat_id.is_none());
        assert!(!m.is_worker_running());
    }

    #[tokio::test]
    async fn test_pause_resume_transitions() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, ScriptedSource::new(5), CountingSink::new(), 10, |_| {});

        m.add_chat(-1).await.unwrap();
        assert!(m.pause_chat(-1).await.unwrap());
        assert_eq!(m.get_progress(-1).await.unwrap().status, SyncStatus::Paused);
        // Pausing twice is rejected.
        assert!(!m.pause_chat(-1).await.unwrap());
        assert!(m.resume_chat(-1).await.unwrap());
        assert_eq!(m.get_progress(-1).await.unwrap().status, SyncStatus::Pending);
        // Resuming a non-paused chat is rejected; unknown chats too.
        assert!(!m.resume_chat(-1).await.unwrap());
        assert!(!m.resume_chat(-99).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_completed_removes_records() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, ScriptedSource::new(5), CountingSink::new(), 10, |_| {});

        m.add_chat(-1).await.unwrap();
        m.sync_chat(-1, None).await.unwrap();
        m.add_chat(-2).await.unwrap();

        assert_eq!(m.clear_completed().await.unwrap(), 1);
        assert!(m.get_progress(-1).await.is_none());
        assert!(m.get_progress(-2).await.is_some());
    }

    #[tokio::test]
    async fn test_progress_callback_fires_per_batch() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, ScriptedSource::new(25), CountingSink::new(), 10, |_| {});

        m.add_chat(-1).await.unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb = move |p: &SyncProgress| {
            seen_cb.lock().unwrap().push(p.synced_count);
        };
        m.sync_chat(-1, Some(&cb)).await.unwrap();

        let counts = seen.lock().unwrap().clone();
        // Three batches plus the completion callback.
        assert_eq!(counts, vec![10, 20, 25, 25]);
    }
}
