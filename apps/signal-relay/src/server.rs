use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::info;

use crate::config::ServerConfig;
use crate::protocol::PeerId;
use crate::registry::Registry;
use crate::router::SignalRouter;
use crate::session::{self, SessionConfig};

pub struct AppState {
    router: SignalRouter,
    session: SessionConfig,
    max_message_size: usize,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn registry(&self) -> &Registry {
        self.router.registry()
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    online: usize,
    peers: Vec<PeerId>,
}

/// Build the HTTP surface: signaling socket, health, stats, metrics and
/// optional static assets.
pub fn build_router(
    config: &ServerConfig,
    registry: Registry,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = Arc::new(AppState {
        router: SignalRouter::new(registry, config.session.write_timeout),
        session: config.session.clone(),
        max_message_size: config.max_message_size,
        metrics,
    });

    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    if let Some(dir) = &config.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("signal-relay listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let router = state.router.clone();
    let config = state.session.clone();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| session::run(socket, router, config, remote_addr))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let peers = state.registry().peers();
    Json(StatsResponse {
        online: peers.len(),
        peers,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerHandle;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_ok() {
        let app = build_router(&ServerConfig::default(), Registry::new(), None);
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stats_lists_online_peers() {
        let registry = Registry::new();
        let (bob, _bob_rx) = PeerHandle::channel(1);
        let (alice, _alice_rx) = PeerHandle::channel(1);
        registry.register("bob", bob);
        registry.register("alice", alice);

        let app = build_router(&ServerConfig::default(), registry, None);
        let response = app
            .oneshot(Request::get("/debug/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats, json!({ "online": 2, "peers": ["alice", "bob"] }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn plain_request_to_socket_path_is_rejected() {
        let app = build_router(&ServerConfig::default(), Registry::new(), None);
        let response = app
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[test_timeout::tokio_timeout_test]
    async fn metrics_without_recorder_is_not_found() {
        let app = build_router(&ServerConfig::default(), Registry::new(), None);
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
