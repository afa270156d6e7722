use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{history, StoreError, StoreSettings};

/// In-process store backend.
///
/// Holds the same records as the Redis layout and records bus publishes so
/// callers can inspect them.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    settings: StoreSettings,
    state: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tokens: HashMap<String, i64>,
    blocked: Vec<i64>,
    names: HashMap<i64, String>,
    history: HashMap<i64, HashMap<String, String>>,
    published: Vec<(String, String)>,
    history_appends: usize,
    unavailable: bool,
    history_unavailable: bool,
}

impl MemoryStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self { settings, state: Arc::new(RwLock::new(MemoryState::default())) }
    }

    /// Register a user: token lookup and display name.
    pub async fn add_user(&self, user_id: i64, token: &str, name: &str) {
        let mut guard = self.state.write().await;
        guard.tokens.insert(token.to_string(), user_id);
        guard.names.insert(user_id, name.to_string());
    }

    /// Register a token without a display name record.
    pub async fn add_token(&self, user_id: i64, token: &str) {
        self.state.write().await.tokens.insert(token.to_string(), user_id);
    }

    pub async fn block_user(&self, user_id: i64) {
        self.state.write().await.blocked.push(user_id);
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Make only history reads and writes fail.
    pub async fn set_history_unavailable(&self, unavailable: bool) {
        self.state.write().await.history_unavailable = unavailable;
    }

    /// Every `(channel, payload)` published so far, oldest first.
    pub async fn published(&self) -> Vec<(String, String)> {
        self.state.read().await.published.clone()
    }

    /// Successful history inserts so far.
    pub async fn history_appends(&self) -> usize {
        self.state.read().await.history_appends
    }

    pub(super) async fn ping(&self) -> Result<(), StoreError> {
        self.state.read().await.check()
    }

    pub(super) async fn user_id_for_token(&self, token: &str) -> Result<Option<i64>, StoreError> {
        let guard = self.state.read().await;
        guard.check()?;
        Ok(guard.tokens.get(token).copied())
    }

    pub(super) async fn blocked_user_ids(&self) -> Result<Vec<i64>, StoreError> {
        let guard = self.state.read().await;
        guard.check()?;
        Ok(guard.blocked.clone())
    }

    pub(super) async fn display_name(&self, user_id: i64) -> Result<String, StoreError> {
        let guard = self.state.read().await;
        guard.check()?;
        guard
            .names
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::Missing(self.settings.name_key(user_id)))
    }

    pub(super) async fn insert_history(
        &self,
        video_session_id: i64,
        key: i64,
        entry: &str,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.write().await;
        guard.check_history()?;
        let bucket = guard.history.entry(video_session_id).or_default();
        bucket.insert(key.to_string(), entry.to_string());
        guard.history_appends += 1;
        Ok(())
    }

    pub(super) async fn trim_history(&self, video_session_id: i64) -> Result<usize, StoreError> {
        let mut guard = self.state.write().await;
        guard.check_history()?;
        let Some(bucket) = guard.history.get_mut(&video_session_id) else {
            return Ok(0);
        };
        let evicted =
            history::keys_to_evict(bucket.keys().cloned().collect(), self.settings.max_history);
        for key in &evicted {
            bucket.remove(key);
        }
        Ok(evicted.len())
    }

    pub(super) async fn read_history(
        &self,
        video_session_id: i64,
    ) -> Result<HashMap<String, String>, StoreError> {
        let guard = self.state.read().await;
        guard.check_history()?;
        Ok(guard.history.get(&video_session_id).cloned().unwrap_or_default())
    }

    pub(super) async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut guard = self.state.write().await;
        guard.check()?;
        guard.published.push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

impl MemoryState {
    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn check_history(&self) -> Result<(), StoreError> {
        self.check()?;
        if self.history_unavailable {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}
