use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::backhaul::telemetry::SharedPrometheusHandle;
use crate::backhaul::tunnel::{channel::{Channel, ChannelInfo}, registry::Registry};

#[derive(Clone)]
pub struct AdminState {
    pub prom: SharedPrometheusHandle,
    pub channels: Arc<Registry<Channel>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/channels", get(channels))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

#[derive(Debug, Serialize)]
struct ChannelEntry {
    id: u64,
    #[serde(flatten)]
    info: ChannelInfo,
}

async fn channels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut out = Vec::new();
    for (id, ch) in st.channels.snapshot().await {
        out.push(ChannelEntry {
            id,
            info: ch.info().await,
        });
    }
    (StatusCode::OK, Json(out))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n");
        conn.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        conn.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn serves_health_and_empty_channel_list() {
        let port = portpicker::pick_unused_port().expect("free port");
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let state = AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            channels: Arc::new(Registry::new()),
        };
        let shutdown = CancellationToken::new();
        let serve = tokio::spawn(serve_with_shutdown(addr, state, shutdown.clone()));

        let mut health = String::new();
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                health = http_get(addr, "/health").await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.ends_with("{\"ok\":true}"), "{health}");

        let channels = http_get(addr, "/channels").await;
        assert!(channels.ends_with("[]"), "{channels}");

        shutdown.cancel();
        assert!(serve.await.unwrap().is_ok());
    }
}
