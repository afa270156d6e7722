// Chat history bucket policy shared by every store backend.
//
// A session's history is a hash keyed by creation time in milliseconds.
// Replay and eviction both walk the keys oldest first.

use std::collections::HashMap;

use chrono::Utc;

/// Key for an entry created now.
pub fn now_key() -> i64 {
    Utc::now().timestamp_millis()
}

/// Hash holding the history of one video session.
pub fn bucket_key(messages_prefix: &str, video_session_id: i64) -> String {
    format!("{messages_prefix}_{video_session_id}")
}

/// Sort history keys oldest first.
///
/// Numeric keys compare by value; keys that are not timestamps sort before
/// all numeric keys, among themselves lexicographically.
pub fn sort_keys(keys: &mut [String]) {
    keys.sort_by_cached_key(|key| (key.parse::<i64>().ok(), key.clone()));
}

/// Keys to delete so at most `max_entries` remain, oldest first.
pub fn keys_to_evict(mut keys: Vec<String>, max_entries: usize) -> Vec<String> {
    if keys.len() <= max_entries {
        return Vec::new();
    }
    sort_keys(&mut keys);
    keys.truncate(keys.len() - max_entries);
    keys
}

/// Bucket values in chronological key order.
pub fn ordered_values(bucket: HashMap<String, String>) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = bucket.into_iter().collect();
    entries.sort_by_cached_key(|(key, _)| (key.parse::<i64>().ok(), key.clone()));
    entries
}
