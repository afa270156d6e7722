// Per-payload state machine: validate, authorize, mutate the originating
// client, and decide what is stored, replied or broadcast.
//
// Authorization failures reply to the client. Store failures are logged and
// end processing without a reply.

use std::collections::HashMap;

use sessionchat_common::protocol::{ChatMessageWithUser, Envelope, EnvelopeHead, Payload, Presence};
use tracing::{debug, error, warn};

use super::client::Client;
use crate::{
    metrics,
    store::{history, SessionStore, StoreError},
};

/// What the hub does after a payload has been processed.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Nothing,
    /// Send to the originating client only.
    Reply(Envelope),
    /// Fan out to every client listening to the chat line's session.
    Broadcast(Envelope),
}

pub async fn process(
    store: &SessionStore,
    presence_channel: &str,
    client: &mut Client,
    head: &EnvelopeHead,
) -> Outcome {
    let token = head.token.as_str();

    let user_id = match store.user_id_for_token(token).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            debug!(client_id = %client.id, "rejecting unknown token");
            return Outcome::Reply(Envelope::token_invalid(token));
        }
        Err(err) => {
            store_failure("token_lookup", &err);
            return Outcome::Nothing;
        }
    };
    client.authenticate(token, user_id);

    match store.is_user_blocked(user_id).await {
        Ok(false) => {}
        Ok(true) => {
            debug!(client_id = %client.id, user_id, "rejecting blocked user");
            return Outcome::Reply(Envelope::user_blocked(token));
        }
        Err(err) => {
            store_failure("blocked_lookup", &err);
            return Outcome::Nothing;
        }
    }

    let name = match store.display_name(user_id).await {
        Ok(name) => name,
        Err(err) => {
            store_failure("name_lookup", &err);
            return Outcome::Nothing;
        }
    };

    let payload = match head.payload() {
        Ok(payload) => payload,
        Err(err) => {
            debug!(client_id = %client.id, error = %err, "dropping frame with mismatched data");
            return Outcome::Nothing;
        }
    };

    match payload {
        Payload::Message(chat) => {
            client.video_session_id = chat.video_session_id;
            let line = ChatMessageWithUser::from_chat(chat, user_id, name);
            let envelope = Envelope::chat(token, line);
            let encoded = match envelope.encode() {
                Ok(encoded) => encoded,
                Err(err) => {
                    error!(error = %err, "failed to encode chat envelope");
                    return Outcome::Nothing;
                }
            };
            if let Err(err) = store.append_history(client.video_session_id, &encoded).await {
                store_failure("history_append", &err);
                return Outcome::Nothing;
            }
            Outcome::Broadcast(envelope)
        }
        Payload::StopMessage => {
            client.allow_message = false;
            Outcome::Nothing
        }
        Payload::StartMessage(start) => {
            client.video_session_id = start.video_session_id;
            client.allow_message = true;
            match store.read_history(start.video_session_id).await {
                Ok(bucket) => Outcome::Reply(Envelope::history(token, replay(bucket))),
                Err(err) => {
                    store_failure("history_read", &err);
                    Outcome::Nothing
                }
            }
        }
        Payload::Presence(presence) => {
            publish_presence(store, presence_channel, presence).await;
            Outcome::Nothing
        }
        Payload::FirstPresence(mut presence) => {
            presence.is_first = true;
            publish_presence(store, presence_channel, presence).await;
            Outcome::Nothing
        }
        Payload::HeartBit | Payload::Other(_) => Outcome::Nothing,
    }
}

/// Chat lines of a history bucket, oldest first. Unreadable entries are skipped.
fn replay(bucket: HashMap<String, String>) -> Vec<ChatMessageWithUser> {
    history::ordered_values(bucket)
        .into_iter()
        .filter_map(|(key, raw)| {
            let decoded = EnvelopeHead::decode(raw.as_bytes())
                .and_then(|head| head.data_as::<ChatMessageWithUser>());
            match decoded {
                Ok(chat) => Some(chat),
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable history entry");
                    None
                }
            }
        })
        .collect()
}

async fn publish_presence(store: &SessionStore, channel: &str, presence: Presence) {
    let encoded = match serde_json::to_string(&presence) {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(error = %err, "failed to encode presence descriptor");
            return;
        }
    };
    match store.publish(channel, &encoded).await {
        Ok(()) => metrics::increment_bus_publishes(),
        Err(err) => store_failure("presence_publish", &err),
    }
}

fn store_failure(operation: &str, err: &StoreError) {
    metrics::increment_store_failures(operation);
    error!(operation, error = %err, "session store call failed");
}
