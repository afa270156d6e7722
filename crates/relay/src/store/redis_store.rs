use std::collections::HashMap;

use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use super::{history, StoreError, StoreSettings};

const SCAN_BATCH: usize = 500;

/// Redis backend.
///
/// Layout (all keys under the configured prefixes):
/// - `{users}user_{id}` -> token
/// - `{users}blocked_users` -> JSON list of user ids
/// - `{users}name_{id}` -> display name
/// - `{messages}_{video_session_id}` -> hash of `created_ms -> chat envelope`
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    settings: StoreSettings,
}

impl RedisStore {
    pub async fn connect(url: &str, settings: StoreSettings) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection, settings })
    }

    pub(super) async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Scan the token keys and return the id of the first key holding `token`.
    pub(super) async fn user_id_for_token(&self, token: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection.clone();
        let pattern = self.settings.token_pattern();

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(None);
        }

        // Keys can expire between SCAN and MGET; those come back as nil.
        let tokens: Vec<Option<String>> =
            redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        for (key, stored) in keys.iter().zip(tokens) {
            if stored.as_deref() != Some(token) {
                continue;
            }
            match self.settings.user_id_from_token_key(key) {
                Some(user_id) => return Ok(Some(user_id)),
                None => warn!(key = %key, "token key does not end in a numeric user id"),
            }
        }

        Ok(None)
    }

    /// A missing blocked-users key is an empty set.
    pub(super) async fn blocked_user_ids(&self) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.connection.clone();
        let key = self.settings.blocked_users_key();
        let raw: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|source| StoreError::Serialization { key, source }),
            None => Ok(Vec::new()),
        }
    }

    pub(super) async fn display_name(&self, user_id: i64) -> Result<String, StoreError> {
        let mut conn = self.connection.clone();
        let key = self.settings.name_key(user_id);
        let name: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        name.ok_or(StoreError::Missing(key))
    }

    pub(super) async fn insert_history(
        &self,
        video_session_id: i64,
        key: i64,
        entry: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let bucket = history::bucket_key(&self.settings.messages_prefix, video_session_id);
        let _: i64 =
            redis::cmd("HSET").arg(&bucket).arg(key).arg(entry).query_async(&mut conn).await?;
        Ok(())
    }

    pub(super) async fn trim_history(&self, video_session_id: i64) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        let bucket = history::bucket_key(&self.settings.messages_prefix, video_session_id);
        let keys: Vec<String> = redis::cmd("HKEYS").arg(&bucket).query_async(&mut conn).await?;

        let evicted = history::keys_to_evict(keys, self.settings.max_history);
        if evicted.is_empty() {
            return Ok(0);
        }

        let _: i64 = redis::cmd("HDEL").arg(&bucket).arg(&evicted).query_async(&mut conn).await?;
        debug!(bucket = %bucket, evicted = evicted.len(), "trimmed chat history");
        Ok(evicted.len())
    }

    pub(super) async fn read_history(
        &self,
        video_session_id: i64,
    ) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.connection.clone();
        let bucket = history::bucket_key(&self.settings.messages_prefix, video_session_id);
        let entries: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&bucket).query_async(&mut conn).await?;
        Ok(entries)
    }

    pub(super) async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("PUBLISH").arg(channel).arg(payload).query_async(&mut conn).await?;
        Ok(())
    }
}
