// Connection registry actor.
//
// One task owns every live client. Registration, removal and payload
// processing arrive as commands on a single queue and run one at a time in
// arrival order, so membership and per-client state never race.

pub mod client;
mod machine;
mod pipeline;

use std::collections::HashMap;

use tokio::{
    sync::{mpsc, mpsc::error::TrySendError, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub use client::{Client, ClientId};

use crate::{metrics, store::SessionStore};

const COMMAND_BUFFER: usize = 1024;

#[derive(Debug)]
pub enum HubCommand {
    Register(Client),
    Unregister(ClientId),
    Submit { client_id: ClientId, raw: Vec<u8> },
    LiveClients(oneshot::Sender<usize>),
}

#[derive(Debug, thiserror::Error)]
#[error("hub task is not running")]
pub struct HubClosed;

/// Cloneable sender side of the hub's command queue.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn register(&self, client: Client) -> Result<(), HubClosed> {
        self.send(HubCommand::Register(client)).await
    }

    pub async fn unregister(&self, client_id: ClientId) -> Result<(), HubClosed> {
        self.send(HubCommand::Unregister(client_id)).await
    }

    /// Queue a raw inbound frame for processing on behalf of `client_id`.
    pub async fn submit(&self, client_id: ClientId, raw: Vec<u8>) -> Result<(), HubClosed> {
        self.send(HubCommand::Submit { client_id, raw }).await
    }

    pub async fn live_clients(&self) -> Result<usize, HubClosed> {
        let (reply, receiver) = oneshot::channel();
        self.send(HubCommand::LiveClients(reply)).await?;
        receiver.await.map_err(|_| HubClosed)
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.commands.send(command).await.map_err(|_| HubClosed)
    }
}

#[cfg(test)]
impl HubHandle {
    /// A handle whose commands land on a queue the caller drains itself.
    pub(crate) fn from_sender(commands: mpsc::Sender<HubCommand>) -> Self {
        Self { commands }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSettings {
    /// Receives every inbound chat frame verbatim.
    pub app_channel: String,
    /// Receives presence descriptors.
    pub presence_channel: String,
}

pub struct Hub {
    clients: HashMap<ClientId, Client>,
    store: SessionStore,
    settings: HubSettings,
    commands: mpsc::Receiver<HubCommand>,
}

impl Hub {
    pub fn new(store: SessionStore, settings: HubSettings) -> (Self, HubHandle) {
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let hub = Self { clients: HashMap::new(), store, settings, commands };
        (hub, HubHandle { commands: sender })
    }

    /// Process commands until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command).await;
        }
        info!(live_clients = self.clients.len(), "hub stopped");
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(client) => self.register(client),
            HubCommand::Unregister(client_id) => {
                if self.remove(client_id).is_some() {
                    debug!(client_id = %client_id, "client unregistered");
                }
            }
            HubCommand::Submit { client_id, raw } => self.process_payload(client_id, raw).await,
            HubCommand::LiveClients(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }

    fn register(&mut self, client: Client) {
        debug!(client_id = %client.id, remote_addr = %client.remote_addr, "client registered");
        if let Some(previous) = self.clients.insert(client.id, client) {
            warn!(client_id = %previous.id, "client registered twice; replaced previous handle");
        }
        metrics::set_live_clients(self.clients.len());
    }

    /// Drop the client and with it the sending half of its outbound queue.
    fn remove(&mut self, client_id: ClientId) -> Option<Client> {
        let removed = self.clients.remove(&client_id);
        if removed.is_some() {
            metrics::set_live_clients(self.clients.len());
        }
        removed
    }

    /// Queue a frame for one client without waiting. A client that cannot
    /// take the frame is evicted.
    fn deliver(&mut self, client_id: ClientId, frame: String) -> bool {
        let Some(client) = self.clients.get(&client_id) else {
            return false;
        };
        let reason = match client.try_send(frame) {
            Ok(()) => return true,
            Err(TrySendError::Full(_)) => "backpressure",
            Err(TrySendError::Closed(_)) => "closed",
        };
        if let Some(evicted) = self.remove(client_id) {
            warn!(
                client_id = %evicted.id,
                user_id = evicted.user_id,
                reason,
                "evicting client that cannot accept frames"
            );
            metrics::increment_evictions(reason);
        }
        false
    }
}

/// Start the hub on the current runtime.
pub fn spawn_hub(store: SessionStore, settings: HubSettings) -> (HubHandle, JoinHandle<()>) {
    let (hub, handle) = Hub::new(store, settings);
    (handle, tokio::spawn(hub.run()))
}
