use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bridge_core::{Bridge, LocalBus};
use serde_json::Value;
use shared::protocol::RpcResponse;
use terminal_integration::{memory::InMemoryTerminal, TerminalSession, UnavailableTerminal};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, spawn_reload, CONFIG_FILE};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    bus: Arc<LocalBus>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let addr = parse_bind_addr(&settings.bind_addr)?;
    let terminal: Arc<dyn TerminalSession> = if settings.simulate_terminal {
        info!("using simulated terminal");
        Arc::new(InMemoryTerminal::with_sample_data().await)
    } else {
        Arc::new(UnavailableTerminal::new())
    };

    let bus = LocalBus::new();
    let bridge = Bridge::start(
        terminal,
        bus.clone(),
        settings.connection.clone(),
        settings.bridge_options(),
    )
    .await
    .map_err(|err| {
        error!(error = %format!("{err:#}"), "failed to register bridge responders");
        err
    })?;
    bridge
        .watch_settings(spawn_reload(
            PathBuf::from(CONFIG_FILE),
            settings.reload_interval(),
            settings.connection.clone(),
        ))
        .await;

    let app = build_router(Arc::new(AppState { bus }));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            bridge.shutdown().await;
            return Err(err.into());
        }
    };
    info!(%addr, "bridge server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    bridge.shutdown().await;
    served?;
    Ok(())
}

fn parse_bind_addr(raw: &str) -> anyhow::Result<SocketAddr> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid bind_addr '{raw}'"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutdown requested");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/rpc/:topic", post(rpc))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn rpc(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<RpcResponse>) {
    let body = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => value,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(RpcResponse::failure(format!("Invalid JSON body: {err}"))),
                )
            }
        }
    };

    match state.bus.request(&topic, body).await {
        Some(response) => (StatusCode::OK, Json(response)),
        None => {
            debug!(%topic, "rpc for topic without responder");
            (
                StatusCode::NOT_FOUND,
                Json(RpcResponse::failure(format!(
                    "No responder registered for topic: {topic}"
                ))),
            )
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut published = BroadcastStream::new(state.bus.subscribe());

    let send_task = tokio::spawn(async move {
        while let Some(next) = published.next().await {
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "ws subscriber fell behind");
                    continue;
                }
            };
            let text = match serde_json::to_string(&message) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
