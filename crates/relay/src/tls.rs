// TLS termination for the socket listener.
//
// Handshakes run on their own tasks so a slow client never holds up accepts.

use std::{io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::connect_info::Connected,
    serve::{IncomingStream, Listener},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::{debug, warn};

use crate::ws::PeerAddr;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKLOG: usize = 128;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Build an acceptor from PEM files: a certificate chain and one private key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("failed to read TLS certificate {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("failed to read TLS key {}", key_path.display()))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse TLS certificates")?;
    anyhow::ensure!(!certs.is_empty(), "no certificate found in {}", cert_path.display());
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("failed to parse TLS private key")?
        .with_context(|| format!("no private key found in {}", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A listener yielding TLS streams that completed their handshake.
pub struct TlsListener {
    local_addr: SocketAddr,
    accepted: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
}

impl TlsListener {
    pub fn new(listener: TcpListener, acceptor: TlsAcceptor) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (sender, accepted) = mpsc::channel(ACCEPT_BACKLOG);
        tokio::spawn(accept_loop(listener, acceptor, sender));
        Ok(Self { local_addr, accepted })
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.accepted.recv().await {
            Some(accepted) => accepted,
            // The accept loop only stops once this receiver is gone.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

impl Connected<IncomingStream<'_, TlsListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    sender: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    while !sender.is_closed() {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "failed to accept TCP connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => {
                    let _ = sender.send((tls_stream, peer)).await;
                }
                Ok(Err(err)) => debug!(peer = %peer, error = %err, "TLS handshake failed"),
                Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::{
        net::{TcpListener, TcpStream},
        time::{timeout, Duration},
    };
    use tokio_rustls::{rustls::pki_types::ServerName, TlsConnector};
    use tokio_tungstenite::{client_async, tungstenite::Message as WsFrame};

    use super::{load_acceptor, TlsListener};
    use crate::{
        hub::{spawn_hub, HubSettings},
        store::{MemoryStore, SessionStore, StoreSettings},
        ws::{router, PeerAddr, SocketState},
    };

    fn temp_file(contents: &str) -> PathBuf {
        let name = format!("sessionchat-tls-{}.pem", uuid::Uuid::new_v4());
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, contents).expect("temp file should be writable");
        path
    }

    #[test]
    fn missing_certificate_file_names_the_path() {
        let missing = std::env::temp_dir().join("sessionchat-tls-does-not-exist.pem");
        let error = load_acceptor(&missing, &missing).err().expect("load should fail");
        assert!(error.to_string().contains("sessionchat-tls-does-not-exist.pem"));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let cert = temp_file("not a certificate\n");
        let key = temp_file("not a key\n");
        let error = load_acceptor(&cert, &key).err().expect("load should fail");
        assert!(error.to_string().contains("no certificate found"));
        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }

    #[tokio::test]
    async fn serves_the_socket_over_tls() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("self-signed certificate should generate");
        let cert = temp_file(&certified.cert.pem());
        let key = temp_file(&certified.signing_key.serialize_pem());
        let acceptor = load_acceptor(&cert, &key).expect("acceptor should load");

        let memory = MemoryStore::new(StoreSettings {
            users_prefix: String::new(),
            messages_prefix: "messages".to_string(),
            max_history: 50,
        });
        memory.add_user(1, "tok-a", "Ana").await;
        let (hub, _task) = spawn_hub(
            SessionStore::Memory(memory),
            HubSettings {
                app_channel: "chat".to_string(),
                presence_channel: "presence".to_string(),
            },
        );
        let app = router(SocketState { hub, outbound_capacity: 16 }, false);

        let tcp = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = tcp.local_addr().expect("listener should expose local address");
        let listener = TlsListener::new(tcp, acceptor).expect("TLS listener should start");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<PeerAddr>())
                .await
                .expect("TLS server should run for test");
        });

        let mut roots = rustls::RootCertStore::empty();
        roots.add(certified.cert.der().clone()).expect("certificate should be a valid root");
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));
        let tcp = TcpStream::connect(addr).await.expect("client should connect");
        let server_name = ServerName::try_from("localhost").expect("server name should parse");
        let tls = connector.connect(server_name, tcp).await.expect("TLS handshake should succeed");
        let url = format!("wss://localhost:{}/", addr.port());
        let (mut socket, _) = client_async(url, tls).await.expect("socket upgrade should succeed");

        let start = json!({ "Type": "START_MESSAGE", "Token": "tok-a", "Data": { "video_session_id": 4 } });
        socket.send(WsFrame::Text(start.to_string().into())).await.expect("frame should send");
        let frame = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for history")
            .expect("socket should remain open")
            .expect("socket frame should decode");
        let WsFrame::Text(payload) = frame else {
            panic!("expected a text frame, got {frame:?}");
        };
        let reply: Value = serde_json::from_str(&payload).expect("reply should be JSON");
        assert_eq!(reply["Type"], "MESSAGE");
        assert_eq!(reply["Data"], json!([]));

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }
}
