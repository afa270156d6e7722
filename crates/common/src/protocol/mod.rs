// Wire protocol for the video-session chat socket.
//
// Every frame is a JSON object `{"Type", "Token", "Data", "Error"}` where the
// shape of `Data` depends on `Type`.

pub mod envelope;
pub mod payload;

pub use envelope::{Data, Envelope, EnvelopeHead, MessageType, Payload};
pub use payload::{ChatMessage, ChatMessageWithUser, Presence, StartMessage};

/// Marker sent to sockets that lost their session to a newer login.
pub const SOCKET_LOGIN_ERROR: &str = "socket_login_error";
/// Error text for tokens that do not resolve to a user.
pub const TOKEN_INVALID_ERROR: &str = "token is invalid!";
/// Error text for blocked users.
pub const USER_BLOCKED_ERROR: &str = "User blocked";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not a valid envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("`Data` does not match the shape required by {kind}: {source}")]
    Data {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
