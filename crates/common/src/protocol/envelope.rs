use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{
    payload::{ChatMessage, ChatMessageWithUser, Presence, StartMessage},
    DecodeError, SOCKET_LOGIN_ERROR, TOKEN_INVALID_ERROR, USER_BLOCKED_ERROR,
};

/// Logical frame type carried in `Type`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Message,
    StartMessage,
    StopMessage,
    HeartBit,
    ErrorMessageInvalid,
    ErrorTokenInvalid,
    Presence,
    FirstPresence,
    /// Any type string this build does not know, or a missing `Type`.
    #[default]
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "MESSAGE",
            Self::StartMessage => "START_MESSAGE",
            Self::StopMessage => "STOP_MESSAGE",
            Self::HeartBit => "HEART_BIT",
            Self::ErrorMessageInvalid => "ERROR_MESSAGE_INVALID",
            Self::ErrorTokenInvalid => "ERROR_TOKEN_INVALID",
            Self::Presence => "PRESENCE",
            Self::FirstPresence => "FIRST_PRESENCE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// The type-independent part of an inbound frame.
///
/// `Data` is kept as raw JSON until [`EnvelopeHead::payload`] dispatches on
/// `Type`, so a frame whose `Data` does not match its type still yields a
/// usable token.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnvelopeHead {
    #[serde(rename = "Type", default, deserialize_with = "null_as_default")]
    pub kind: MessageType,
    #[serde(rename = "Token", default, deserialize_with = "null_as_default")]
    pub token: String,
    #[serde(rename = "Data", default)]
    pub data: Value,
    #[serde(rename = "Error", default, deserialize_with = "null_as_default")]
    pub error: String,
}

/// Inbound frame decoded by its `Type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Message(ChatMessage),
    StartMessage(StartMessage),
    StopMessage,
    Presence(Presence),
    FirstPresence(Presence),
    HeartBit,
    /// Types with no inbound meaning (error frames, unknown strings).
    Other(MessageType),
}

impl EnvelopeHead {
    /// Parse the envelope fields of a raw frame. The frame must be a JSON object.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(raw).map_err(DecodeError::Envelope)?;
        if !value.is_object() {
            return Err(DecodeError::Envelope(<serde_json::Error as serde::de::Error>::custom(
                "envelope must be a JSON object",
            )));
        }
        Self::deserialize(value).map_err(DecodeError::Envelope)
    }

    /// Decode `Data` into the payload selected by `Type`.
    pub fn payload(&self) -> Result<Payload, DecodeError> {
        Ok(match self.kind {
            MessageType::Message => Payload::Message(self.data_as()?),
            MessageType::StartMessage => Payload::StartMessage(self.data_as()?),
            MessageType::StopMessage => Payload::StopMessage,
            MessageType::Presence => Payload::Presence(self.data_as()?),
            MessageType::FirstPresence => Payload::FirstPresence(self.data_as()?),
            MessageType::HeartBit => Payload::HeartBit,
            other => Payload::Other(other),
        })
    }

    /// Decode `Data` as `T`. A `null` or absent `Data` yields `T::default()`.
    pub fn data_as<T>(&self) -> Result<T, DecodeError>
    where
        T: DeserializeOwned + Default,
    {
        if self.data.is_null() {
            return Ok(T::default());
        }
        T::deserialize(&self.data)
            .map_err(|source| DecodeError::Data { kind: self.kind.as_str(), source })
    }
}

/// `Data` of an outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Data {
    Text(String),
    Chat(ChatMessageWithUser),
    History(Vec<ChatMessageWithUser>),
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub kind: MessageType,
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "Data")]
    pub data: Data,
    #[serde(rename = "Error")]
    pub error: String,
}

impl Envelope {
    /// A chat line ready for broadcast and storage.
    pub fn chat(token: impl Into<String>, chat: ChatMessageWithUser) -> Self {
        Self {
            kind: MessageType::Message,
            token: token.into(),
            data: Data::Chat(chat),
            error: String::new(),
        }
    }

    /// Replay of a session's stored chat, oldest first.
    pub fn history(token: impl Into<String>, entries: Vec<ChatMessageWithUser>) -> Self {
        Self {
            kind: MessageType::Message,
            token: token.into(),
            data: Data::History(entries),
            error: String::new(),
        }
    }

    pub fn token_invalid(token: impl Into<String>) -> Self {
        Self {
            kind: MessageType::ErrorTokenInvalid,
            token: token.into(),
            data: Data::Text(String::new()),
            error: TOKEN_INVALID_ERROR.to_string(),
        }
    }

    /// Notice for a socket whose user has logged in from another address.
    pub fn socket_login_error(token: impl Into<String>) -> Self {
        Self {
            kind: MessageType::ErrorTokenInvalid,
            token: token.into(),
            data: Data::Text(SOCKET_LOGIN_ERROR.to_string()),
            error: SOCKET_LOGIN_ERROR.to_string(),
        }
    }

    pub fn user_blocked(token: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Message,
            token: token.into(),
            data: Data::Text(String::new()),
            error: USER_BLOCKED_ERROR.to_string(),
        }
    }

    /// Session the frame belongs to, for chat lines.
    pub fn video_session_id(&self) -> Option<i64> {
        match &self.data {
            Data::Chat(chat) => Some(chat.video_session_id),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}
