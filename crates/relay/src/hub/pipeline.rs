// The four steps run for every submitted payload, inside the hub task:
// token refresh, duplicate-session notices, bus forward, then process and
// deliver.

use sessionchat_common::protocol::{Envelope, EnvelopeHead, MessageType};
use tracing::{debug, info, warn};

use super::{client::ClientId, machine, machine::Outcome, Hub};
use crate::metrics;

impl Hub {
    pub(super) async fn process_payload(&mut self, client_id: ClientId, raw: Vec<u8>) {
        if !self.clients.contains_key(&client_id) {
            debug!(client_id = %client_id, "dropping payload from unregistered client");
            return;
        }

        metrics::increment_payloads_processed();
        let head = match EnvelopeHead::decode(&raw) {
            Ok(head) => {
                metrics::record_ws_frame(head.kind.as_str(), false);
                Some(head)
            }
            Err(err) => {
                metrics::record_ws_frame("malformed", true);
                debug!(client_id = %client_id, error = %err, "inbound frame is not an envelope");
                None
            }
        };

        if let Some(head) = &head {
            self.refresh_token(client_id, head).await;
        }
        self.notify_superseded(client_id);

        let Some(head) = head else {
            return;
        };

        if head.kind == MessageType::Message {
            self.forward_to_bus(&raw).await;
        }

        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        let outcome =
            machine::process(&self.store, &self.settings.presence_channel, client, &head).await;
        match outcome {
            Outcome::Nothing => {}
            Outcome::Reply(envelope) => self.reply(client_id, &envelope),
            Outcome::Broadcast(envelope) => self.broadcast(&envelope),
        }
    }

    /// Best effort: attach the token, and its user id when it resolves.
    async fn refresh_token(&mut self, client_id: ClientId, head: &EnvelopeHead) {
        if head.token.is_empty() {
            return;
        }
        let resolved = match self.store.user_id_for_token(&head.token).await {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!(client_id = %client_id, error = %err, "token refresh lookup failed");
                None
            }
        };
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.token = head.token.clone();
            if let Some(user_id) = resolved {
                client.user_id = user_id;
            }
        }
    }

    /// Tell older logins of the same user on other addresses that they lost the session.
    fn notify_superseded(&mut self, client_id: ClientId) {
        let Some(origin) = self.clients.get(&client_id) else {
            return;
        };
        let stale: Vec<(ClientId, String)> = self
            .clients
            .values()
            .filter(|other| other.is_superseded_by(origin))
            .map(|other| (other.id, other.token.clone()))
            .collect();
        let user_id = origin.user_id;

        for (stale_id, token) in stale {
            info!(client_id = %stale_id, user_id, "notifying superseded session");
            metrics::increment_superseded_sessions();
            self.reply(stale_id, &Envelope::socket_login_error(token));
        }
    }

    async fn forward_to_bus(&self, raw: &[u8]) {
        let payload = String::from_utf8_lossy(raw);
        match self.store.publish(&self.settings.app_channel, &payload).await {
            Ok(()) => metrics::increment_bus_publishes(),
            Err(err) => {
                metrics::increment_store_failures("bus_forward");
                warn!(channel = %self.settings.app_channel, error = %err, "bus forward failed");
            }
        }
    }

    fn reply(&mut self, client_id: ClientId, envelope: &Envelope) {
        match envelope.encode() {
            Ok(frame) => {
                if self.deliver(client_id, frame) {
                    metrics::increment_direct_replies();
                }
            }
            Err(err) => warn!(error = %err, "failed to encode reply"),
        }
    }

    fn broadcast(&mut self, envelope: &Envelope) {
        let Some(video_session_id) = envelope.video_session_id() else {
            return;
        };
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode broadcast");
                return;
            }
        };

        let recipients: Vec<ClientId> = self
            .clients
            .values()
            .filter(|client| client.receives_chat(video_session_id))
            .map(|client| client.id)
            .collect();
        debug!(video_session_id, recipients = recipients.len(), "broadcasting chat line");
        let delivered = recipients
            .into_iter()
            .filter(|recipient| self.deliver(*recipient, frame.clone()))
            .count();
        metrics::record_broadcast(delivered);
    }
}
