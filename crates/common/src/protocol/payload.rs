// `Data` shapes carried by envelopes.
//
// Inbound structs default missing fields to zero values; a field present with
// the wrong JSON type is still a decode error.

use serde::{Deserialize, Serialize};

/// Client -> Server chat line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatMessage {
    pub msg: String,
    pub video_session_id: i64,
}

/// Server -> Client chat line, enriched with the sender identity.
///
/// This is also the `Data` of every stored history entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatMessageWithUser {
    pub msg: String,
    pub video_session_id: i64,
    pub id: i64,
    pub name: String,
}

impl ChatMessageWithUser {
    pub fn from_chat(chat: ChatMessage, user_id: i64, name: impl Into<String>) -> Self {
        Self {
            msg: chat.msg,
            video_session_id: chat.video_session_id,
            id: user_id,
            name: name.into(),
        }
    }
}

/// Client -> Server subscription to a video session's chat.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StartMessage {
    pub video_session_id: i64,
}

/// Presence descriptor forwarded verbatim to the presence bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Presence {
    /// Presence state reported by the client (`online`, `offline`, ...).
    #[serde(rename = "type")]
    pub state: String,
    #[serde(rename = "users_id")]
    pub user_id: i64,
    #[serde(rename = "videoSessionId")]
    pub video_session_id: i64,
    #[serde(rename = "isFirst")]
    pub is_first: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_uses_bus_field_names() {
        let presence = Presence {
            state: "online".to_string(),
            user_id: 4,
            video_session_id: 9,
            is_first: true,
        };
        let value = serde_json::to_value(&presence).expect("presence should serialize");
        assert_eq!(
            value,
            serde_json::json!({ "type": "online", "users_id": 4, "videoSessionId": 9, "isFirst": true })
        );
    }

    #[test]
    fn missing_fields_default_to_zero_values() {
        let chat: ChatMessage =
            serde_json::from_str(r#"{"msg":"hi"}"#).expect("partial chat should decode");
        assert_eq!(chat, ChatMessage { msg: "hi".to_string(), video_session_id: 0 });
    }

    #[test]
    fn mistyped_field_is_rejected() {
        assert!(serde_json::from_str::<StartMessage>(r#"{"video_session_id":"one"}"#).is_err());
    }

    #[test]
    fn chat_with_user_carries_sender_identity() {
        let chat = ChatMessage { msg: "salam".to_string(), video_session_id: 3 };
        let enriched = ChatMessageWithUser::from_chat(chat, 12, "Sara");
        assert_eq!(enriched.id, 12);
        assert_eq!(enriched.name, "Sara");
        assert_eq!(enriched.video_session_id, 3);
        assert_eq!(enriched.msg, "salam");
    }
}
