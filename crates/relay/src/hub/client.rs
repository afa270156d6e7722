use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

pub type ClientId = Uuid;

/// Per-connection state owned by the hub.
///
/// The transport keeps only the id and the receiving end of `outbound`.
/// Dropping the client closes the queue, which stops the connection writer.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    /// Last token that resolved for this connection; empty until then.
    pub token: String,
    /// Resolved user id; 0 while unauthenticated.
    pub user_id: i64,
    pub remote_addr: String,
    /// Video session the connection chats in; 0 for none.
    pub video_session_id: i64,
    /// Whether chat broadcasts for `video_session_id` are delivered.
    pub allow_message: bool,
    outbound: mpsc::Sender<String>,
}

impl Client {
    pub fn new(remote_addr: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let client = Self {
            id: Uuid::new_v4(),
            token: String::new(),
            user_id: 0,
            remote_addr: remote_addr.into(),
            video_session_id: 0,
            allow_message: false,
            outbound,
        };
        (client, receiver)
    }

    pub fn authenticate(&mut self, token: &str, user_id: i64) {
        self.token = token.to_string();
        self.user_id = user_id;
    }

    pub fn receives_chat(&self, video_session_id: i64) -> bool {
        self.allow_message && self.video_session_id == video_session_id
    }

    /// True when `self` is an older login of the user behind `newer`, made
    /// with a different token from a different address.
    pub fn is_superseded_by(&self, newer: &Client) -> bool {
        self.id != newer.id
            && !self.token.is_empty()
            && self.user_id > 0
            && self.user_id == newer.user_id
            && self.token != newer.token
            && self.remote_addr != newer.remote_addr
    }

    /// Queue a frame without waiting. Fails when the queue is full or the
    /// writer is gone.
    pub(crate) fn try_send(&self, frame: String) -> Result<(), TrySendError<String>> {
        self.outbound.try_send(frame)
    }
}
