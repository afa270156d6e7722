mod config;
mod hub;
mod metrics;
mod store;
mod tls;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{
        header::{self, HeaderValue},
        Request, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{path::Path, sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tower_http::services::ServeFile;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::{
    config::RelayConfig,
    hub::{spawn_hub, HubSettings},
    metrics::GatewayMetrics,
    store::{SessionStore, StoreSettings},
    tls::TlsListener,
    ws::{PeerAddr, SocketState},
};

const REQUEST_ID_HEADER: &str = "x-request-id";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
struct AppState {
    store: SessionStore,
    metrics: Arc<GatewayMetrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = RelayConfig::from_env();
    init_tracing(&config);
    for variable in &config.ignored_vars {
        warn!(variable, "invalid value; using default");
    }

    let gateway_metrics = Arc::new(GatewayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&gateway_metrics));

    let store = SessionStore::connect_redis(
        &config.redis_url,
        StoreSettings {
            users_prefix: config.users_prefix.clone(),
            messages_prefix: config.messages_prefix.clone(),
            max_history: config.max_history,
        },
    )
    .await
    .with_context(|| format!("failed to connect to session store at {}", config.redis_url))?;
    store.ping().await.context("session store did not answer PING")?;

    let tls_acceptor = match &config.tls {
        Some(tls) => Some(tls::load_acceptor(&tls.cert_path, &tls.key_path)?),
        None => None,
    };

    let (hub, _hub_task) = spawn_hub(
        store.clone(),
        HubSettings {
            app_channel: config.app_channel.clone(),
            presence_channel: config.presence_channel.clone(),
        },
    );
    let app = build_router(
        AppState { store, metrics: gateway_metrics },
        SocketState { hub, outbound_capacity: config.outbound_capacity },
        config.test_mode,
        &config.home_page,
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        tls = tls_acceptor.is_some(),
        test_mode = config.test_mode,
        "starting chat gateway"
    );

    let service = app.into_make_service_with_connect_info::<PeerAddr>();
    match tls_acceptor {
        Some(acceptor) => {
            let listener =
                TlsListener::new(listener, acceptor).context("failed to start TLS listener")?;
            axum::serve(listener, service).with_graceful_shutdown(shutdown_signal()).await
        }
        None => axum::serve(listener, service).with_graceful_shutdown(shutdown_signal()).await,
    }
    .context("chat gateway exited unexpectedly")
}

/// `RUST_LOG` takes precedence over the configured filter.
fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_router(state: AppState, socket: SocketState, test_mode: bool, home_page: &Path) -> Router {
    let gateway_metrics = Arc::clone(&state.metrics);
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state);
    if test_mode {
        router = router.route_service("/", ServeFile::new(home_page));
    }
    apply_middleware(router.merge(ws::router(socket, test_mode)), gateway_metrics)
}

fn apply_middleware(router: Router, gateway_metrics: Arc<GatewayMetrics>) -> Router {
    router
        .layer(middleware::from_fn_with_state(gateway_metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            warn!(error = %err, "health check failed to reach session store");
            (StatusCode::SERVICE_UNAVAILABLE, "session store unavailable")
        }
    }
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render_prometheus(),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(
    State(gateway_metrics): State<Arc<GatewayMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    gateway_metrics.record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
