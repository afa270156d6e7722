// Socket transport: upgrade, then a writer task draining the outbound queue
// and a reader loop feeding the hub, each on its own schedule.

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{
        connect_info::Connected,
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    serve::IncomingStream,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::{interval_at, sleep, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::hub::{Client, ClientId, HubHandle};

/// Largest accepted inbound frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const PING_INTERVAL: Duration = Duration::from_secs(54);
/// A connection with no inbound traffic (including pongs) for this long is closed.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
/// How long the writer may take to flush and close once the reader is done.
const WRITE_GRACE: Duration = Duration::from_secs(10);

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Peer address of an accepted connection, plain or TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, TcpListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

#[derive(Clone)]
pub struct SocketState {
    pub hub: HubHandle,
    pub outbound_capacity: usize,
}

/// Socket routes. In test mode the socket lives at `/ws` so `/` can serve the
/// demo page; otherwise every unmatched path upgrades.
pub fn router(state: SocketState, test_mode: bool) -> Router {
    let router = Router::new();
    let router = if test_mode {
        router.route("/ws", get(ws_upgrade))
    } else {
        router.fallback(ws_upgrade)
    };
    router.with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<SocketState>,
    ConnectInfo(PeerAddr(peer)): ConnectInfo<PeerAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let remote_addr = remote_addr(&headers, peer);
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, remote_addr, socket))
}

/// First `X-Forwarded-For` hop when present, else the peer IP without its port.
pub fn remote_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn handle_socket(state: SocketState, remote_addr: String, mut socket: WebSocket) {
    let (client, outbound) = Client::new(remote_addr.clone(), state.outbound_capacity);
    let client_id = client.id;
    if state.hub.register(client).await.is_err() {
        warn!(remote_addr = %remote_addr, "hub is gone; refusing connection");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    info!(client_id = %client_id, remote_addr = %remote_addr, "client connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(client_id, sink, outbound));

    let writer_finished = tokio::select! {
        () = read_pump(client_id, stream, &state.hub) => false,
        _ = &mut writer => true,
    };

    // Unregistering drops the hub's sender, which lets the writer close the socket.
    let _ = state.hub.unregister(client_id).await;
    if !writer_finished && timeout(WRITE_GRACE, &mut writer).await.is_err() {
        debug!(client_id = %client_id, "writer did not finish in time");
        writer.abort();
    }
    info!(client_id = %client_id, remote_addr = %remote_addr, "client disconnected");
}

/// Drain the outbound queue into the socket and keep the peer alive with pings.
async fn write_pump(
    client_id: ClientId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
) {
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        tokio::select! {
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_frame = outbound.recv() => {
                let Some(frame) = maybe_frame else {
                    // The hub dropped this client.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(err) = sink.send(Message::Text(frame.into())).await {
                    debug!(client_id = %client_id, error = %err, "socket write failed");
                    break;
                }
            }
        }
    }
}

/// Forward inbound frames to the hub until the peer leaves or goes quiet.
async fn read_pump(client_id: ClientId, mut stream: SplitStream<WebSocket>, hub: &HubHandle) {
    let read_deadline = sleep(READ_DEADLINE);
    tokio::pin!(read_deadline);

    loop {
        let message = tokio::select! {
            () = &mut read_deadline => {
                debug!(client_id = %client_id, "read deadline elapsed");
                return;
            }
            maybe_message = stream.next() => match maybe_message {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    debug!(client_id = %client_id, error = %err, "socket read failed");
                    return;
                }
                None => return,
            },
        };
        read_deadline.as_mut().reset(Instant::now() + READ_DEADLINE);

        let raw = match message {
            Message::Text(text) => text.as_str().as_bytes().to_vec(),
            Message::Binary(bytes) => bytes.to_vec(),
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if hub.submit(client_id, raw).await.is_err() {
            return;
        }
    }
}
