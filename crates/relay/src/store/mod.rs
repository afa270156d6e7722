// Session store: token lookup, blocked users, display names, chat history and
// the application bus.
//
// The gateway only reads identity records; they are written by the backend
// application that issues tokens.

pub mod history;
mod memory;
mod redis_store;

use std::collections::HashMap;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis failure: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("stored value at `{key}` is not valid JSON: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing record `{0}`")]
    Missing(String),
    #[error("store unavailable")]
    Unavailable,
}

/// Key namespaces and the history cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub users_prefix: String,
    pub messages_prefix: String,
    pub max_history: usize,
}

impl StoreSettings {
    pub fn token_pattern(&self) -> String {
        format!("{}user_*", self.users_prefix)
    }

    pub fn blocked_users_key(&self) -> String {
        format!("{}blocked_users", self.users_prefix)
    }

    pub fn name_key(&self, user_id: i64) -> String {
        format!("{}name_{user_id}", self.users_prefix)
    }

    /// Extract the user id from a token key (`{users_prefix}user_{id}`).
    pub fn user_id_from_token_key(&self, key: &str) -> Option<i64> {
        key.strip_prefix(&self.users_prefix)?.strip_prefix("user_")?.parse().ok()
    }
}

#[derive(Clone)]
pub enum SessionStore {
    Redis(RedisStore),
    #[cfg_attr(not(test), allow(dead_code))]
    Memory(MemoryStore),
}

impl SessionStore {
    pub async fn connect_redis(url: &str, settings: StoreSettings) -> Result<Self, StoreError> {
        Ok(Self::Redis(RedisStore::connect(url, settings).await?))
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Self::Redis(store) => store.ping().await,
            Self::Memory(store) => store.ping().await,
        }
    }

    /// Resolve a client token to its user id. `Ok(None)` means the token is unknown.
    pub async fn user_id_for_token(&self, token: &str) -> Result<Option<i64>, StoreError> {
        match self {
            Self::Redis(store) => store.user_id_for_token(token).await,
            Self::Memory(store) => store.user_id_for_token(token).await,
        }
    }

    pub async fn blocked_user_ids(&self) -> Result<Vec<i64>, StoreError> {
        match self {
            Self::Redis(store) => store.blocked_user_ids().await,
            Self::Memory(store) => store.blocked_user_ids().await,
        }
    }

    pub async fn is_user_blocked(&self, user_id: i64) -> Result<bool, StoreError> {
        Ok(self.blocked_user_ids().await?.contains(&user_id))
    }

    pub async fn display_name(&self, user_id: i64) -> Result<String, StoreError> {
        match self {
            Self::Redis(store) => store.display_name(user_id).await,
            Self::Memory(store) => store.display_name(user_id).await,
        }
    }

    /// Store a serialized chat envelope under the current time and trim the bucket.
    pub async fn append_history(
        &self,
        video_session_id: i64,
        entry: &str,
    ) -> Result<(), StoreError> {
        self.append_history_at(video_session_id, history::now_key(), entry).await
    }

    /// Store an entry under an explicit key, then trim. An existing key is overwritten.
    pub async fn append_history_at(
        &self,
        video_session_id: i64,
        key: i64,
        entry: &str,
    ) -> Result<(), StoreError> {
        match self {
            Self::Redis(store) => store.insert_history(video_session_id, key, entry).await?,
            Self::Memory(store) => store.insert_history(video_session_id, key, entry).await?,
        }
        self.trim_history(video_session_id).await.map(|_| ())
    }

    /// Drop the oldest entries beyond the cap. Returns how many were removed.
    pub async fn trim_history(&self, video_session_id: i64) -> Result<usize, StoreError> {
        match self {
            Self::Redis(store) => store.trim_history(video_session_id).await,
            Self::Memory(store) => store.trim_history(video_session_id).await,
        }
    }

    /// Whole bucket, unordered. Callers sort with [`history::ordered_values`].
    pub async fn read_history(
        &self,
        video_session_id: i64,
    ) -> Result<HashMap<String, String>, StoreError> {
        match self {
            Self::Redis(store) => store.read_history(video_session_id).await,
            Self::Memory(store) => store.read_history(video_session_id).await,
        }
    }

    /// Fire-and-forget publish to a bus channel.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        match self {
            Self::Redis(store) => store.publish(channel, payload).await,
            Self::Memory(store) => store.publish(channel, payload).await,
        }
    }
}
