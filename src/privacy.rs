//! Privacy opt-out management
//!
//! Users can remove themselves from search visibility. The blocked set is
//! persisted as JSON via tempfile + rename, and consulted right after every
//! search response to strip hits from opted-out senders.

use crate::search_client::SearchResponse;
use crate::types::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
struct PrivacyFile {
    #[serde(default)]
    blocked_users: Vec<i64>,
    #[serde(default)]
    last_updated: String,
    #[serde(default)]
    version: String,
}

/// Process-wide set of opted-out user ids.
pub struct PrivacyManager {
    path: PathBuf,
    blocked: Mutex<HashSet<i64>>,
}

impl PrivacyManager {
    pub fn new(path: &Path) -> Result<Self> {
        let blocked = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let file: PrivacyFile = serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("corrupt privacy file {:?}: {}", path, e)))?;
            let set: HashSet<i64> = file.blocked_users.into_iter().collect();
            info!(count = set.len(), "loaded privacy opt-outs");
            set
        } else {
            info!("no existing privacy data, starting fresh");
            HashSet::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            blocked: Mutex::new(blocked),
        })
    }

    fn save_locked(&self, blocked: &HashSet<i64>) -> Result<()> {
        let file = PrivacyFile {
            blocked_users: blocked.iter().copied().collect(),
            last_updated: Utc::now().to_rfc3339(),
            version: "1.0".to_string(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("privacy data saved");
        Ok(())
    }

    /// Opt a user out. Returns true when the user was newly blocked.
    pub fn block_user(&self, user_id: i64) -> Result<bool> {
        let mut blocked = self.blocked.lock().unwrap_or_else(|e| e.into_inner());
        let was_new = blocked.insert(user_id);
        if was_new {
            self.save_locked(&blocked)?;
            info!(user_id, "user opted out of search results");
        }
        Ok(was_new)
    }

    /// Opt a user back in. Returns true when the user had been blocked.
    pub fn unblock_user(&self, user_id: i64) -> Result<bool> {
        let mut blocked = self.blocked.lock().unwrap_or_else(|e| e.into_inner());
        let was_blocked = blocked.remove(&user_id);
        if was_blocked {
            self.save_locked(&blocked)?;
            info!(user_id, "user opted back into search results");
        }
        Ok(was_blocked)
    }

    pub fn is_blocked(&self, user_id: i64) -> bool {
        self.blocked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&user_id)
    }

    /// Snapshot of the blocked set; reads clone so the lock is never held
    /// across filtering.
    pub fn blocked_users(&self) -> Vec<i64> {
        self.blocked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Strip hits from blocked senders and recompute totals. The requested
    /// page is left alone even when it ends up past the new last page.
    pub fn filter_results(&self, results: &mut SearchResponse) {
        let blocked: HashSet<i64> = {
            let guard = self.blocked.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_empty() {
                return;
            }
            guard.clone()
        };

        let before = results.hits.len();
        results.hits.retain(|hit| {
            let sender_blocked = hit.from_user.id != 0 && blocked.contains(&hit.from_user.id);
            let chat_sender_blocked = hit
                .sender_chat
                .as_ref()
                .is_some_and(|c| blocked.contains(&c.id));
            !(sender_blocked || chat_sender_blocked)
        });
        let removed = (before - results.hits.len()) as u64;

        if removed > 0 {
            results.total_hits = results.total_hits.saturating_sub(removed);
            let per_page = results.hits_per_page.max(1) as u64;
            results.total_pages = results.total_hits.div_ceil(per_page) as u32;
            info!(removed, "filtered messages from blocked users");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ChatInfo, ChatType, MessageDocument, SenderInfo};
    use tempfile::TempDir;

    fn hit(sender_id: i64, sender_chat_id: Option<i64>) -> MessageDocument {
        MessageDocument {
            id: format!("-1001-{}", sender_id),
            message_id: sender_id as i32,
            text: "text".into(),
            caption: String::new(),
            chat: ChatInfo {
                id: -1001,
                kind: ChatType::Supergroup,
                title: "chat".into(),
                username: String::new(),
            },
            from_user: SenderInfo {
                id: sender_id,
                ..Default::default()
            },
            sender_chat: sender_chat_id.map(|id| ChatInfo {
                id,
                kind: ChatType::Channel,
                title: "channel".into(),
                username: String::new(),
            }),
            date: 0,
            timestamp: 0,
            entities: Vec::new(),
            is_deleted: false,
            deleted_at: 0,
        }
    }

    #[test]
    fn test_block_unblock_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("privacy.json");
        let pm = PrivacyManager::new(&path).unwrap();

        assert!(pm.block_user(7).unwrap());
        assert!(!pm.block_user(7).unwrap());
        assert!(pm.is_blocked(7));
        assert_eq!(pm.blocked_count(), 1);

        assert!(pm.unblock_user(7).unwrap());
        assert!(!pm.unblock_user(7).unwrap());
        assert!(!pm.is_blocked(7));
    }

    #[test]
    fn test_persistence_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("privacy.json");
        {
            let pm = PrivacyManager::new(&path).unwrap();
            pm.block_user(7).unwrap();
            pm.block_user(8).unwrap();
        }
        let pm = PrivacyManager::new(&path).unwrap();
        assert!(pm.is_blocked(7));
        assert!(pm.is_blocked(8));
        assert_eq!(pm.blocked_count(), 2);
    }

    #[test]
    fn test_filter_strips_blocked_senders() {
        let dir = TempDir::new().unwrap();
        let pm = PrivacyManager::new(&dir.path().join("privacy.json")).unwrap();
        pm.block_user(7).unwrap();

        let mut results = SearchResponse {
            hits: vec![hit(7, None), hit(8, None), hit(9, None)],
            total_hits: 3,
            total_pages: 1,
            page: 1,
            hits_per_page: 10,
            took_ms: 1,
        };
        pm.filter_results(&mut results);

        assert_eq!(results.hits.len(), 2);
        assert_eq!(results.total_hits, 2);
        assert!(results.hits.iter().all(|h| h.from_user.id != 7));
    }

    #[test]
    fn test_filter_checks_sender_chat() {
        let dir = TempDir::new().unwrap();
        let pm = PrivacyManager::new(&dir.path().join("privacy.json")).unwrap();
        pm.block_user(-100555).unwrap();

        let mut results = SearchResponse {
            hits: vec![hit(0, Some(-100555)), hit(8, None)],
            total_hits: 2,
            total_pages: 1,
            page: 1,
            hits_per_page: 10,
            took_ms: 1,
        };
        pm.filter_results(&mut results);
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].from_user.id, 8);
    }

    #[test]
    fn test_filter_recomputes_pages_and_keeps_page() {
        let dir = TempDir::new().unwrap();
        let pm = PrivacyManager::new(&dir.path().join("privacy.json")).unwrap();
        pm.block_user(7).unwrap();

        // 25 total hits over 3 pages; page 3 requested; the filter removes 20.
        let mut results = SearchResponse {
            hits: vec![hit(7, None); 5],
            total_hits: 25,
            total_pages: 3,
            page: 3,
            hits_per_page: 10,
            took_ms: 1,
        };
        pm.filter_results(&mut results);

        assert_eq!(results.hits.len(), 0);
        assert_eq!(results.total_hits, 20);
        assert_eq!(results.total_pages, 2);
        // The requested page is not clamped.
        assert_eq!(results.page, 3);
    }

    #[test]
    fn test_unblocked_sender_with_zero_id_not_filtered() {
        let dir = TempDir::new().unwrap();
        let pm = PrivacyManager::new(&dir.path().join("privacy.json")).unwrap();
        pm.block_user(7).unwrap();

        // Service messages have sender id 0; they must never be stripped by
        // accident.
        let mut results = SearchResponse {
            hits: vec![hit(0, None)],
            total_hits: 1,
            total_pages: 1,
            page: 1,
            hits_per_page: 10,
            took_ms: 1,
        };
        pm.filter_results(&mut results);
        assert_eq!(results.hits.len(), 1);
    }
}
