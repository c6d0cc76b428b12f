//! State storage for pagination and interactive query state
//!
//! The bot keeps per-message query state so pagination callbacks can re-run
//! the original search. The trait leaves room for an external store; the
//! in-memory implementation is what the single-process bot uses.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::types::Result;

/// Key/value store for short-lived bot state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn remove(&self, key: &str) -> Result<()>;

    #[allow(dead_code)]
    async fn clear(&self) -> Result<()>;
}

/// Typed helpers over the string store.
pub struct JsonState;

impl JsonState {
    pub async fn put<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
        store.set(key, &serde_json::to_string(value)?).await
    }

    pub async fn get<T: DeserializeOwned>(
        store: &dyn StateStore,
        key: &str,
    ) -> Result<Option<T>> {
        match store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

/// In-memory storage implementation
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    data: Arc<DashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();

        store.set("key1", "value1").await.unwrap();
        assert_eq!(store.get("key1").await.unwrap(), Some("value1".to_string()));

        store.remove("key1").await.unwrap();
        assert_eq!(store.get("key1").await.unwrap(), None);

        store.set("key2", "value2").await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.get("key2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_state_round_trip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct State {
            keyword: String,
            page: u32,
        }

        let store = MemoryStateStore::new();
        let state = State {
            keyword: "alpha".into(),
            page: 3,
        };
        JsonState::put(&store, "q:1:2", &state).await.unwrap();
        let back: Option<State> = JsonState::get(&store, "q:1:2").await.unwrap();
        assert_eq!(back, Some(state));

        let missing: Option<State> = JsonState::get(&store, "q:9:9").await.unwrap();
        assert!(missing.is_none());
    }
}
